//! Versioned rule table used to classify agent terminal output.
//!
//! Downstream decisions key off the category identity, never the regex
//! text, so rules can be tuned without touching the supervisor. Bump
//! [`CATALOG_VERSION`] whenever a rule changes meaning.

use std::fmt::{Display, Formatter};

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Version of the built-in rule table.
pub const CATALOG_VERSION: u32 = 1;

/// Error sub-kinds, in evaluation order.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Compiler or type-checker errors.
    Compile,
    /// Failing tests.
    Test,
    /// Uncaught exceptions, panics, crashes.
    Runtime,
    /// Filesystem or OS permission failures.
    Permission,
}

impl ErrorKind {
    /// Catalog name of the sub-kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Test => "test",
            Self::Runtime => "runtime",
            Self::Permission => "permission",
        }
    }

    /// Built-in nudge text for this kind of failure.
    #[must_use]
    pub fn default_nudge(self) -> &'static str {
        match self {
            Self::Compile => {
                "The build is failing with compile errors. Read the errors above, fix them, and rebuild."
            }
            Self::Test => {
                "Some tests are failing. Investigate the failures above, fix the cause, and rerun the tests."
            }
            Self::Runtime => {
                "The program hit a runtime error. Inspect the stack trace above and fix the underlying bug."
            }
            Self::Permission => {
                "A command failed with a permission error. Work around it without elevated privileges or pick another approach."
            }
        }
    }
}

/// Completion sub-kinds, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    /// The agent announced the task as complete.
    TaskComplete,
    /// A test run passed.
    TestsPass,
    /// A build succeeded.
    BuildSuccess,
    /// A commit was recorded.
    CommitMade,
    /// A pull request was opened.
    PrCreated,
    /// Generic "done" phrasing.
    ExplicitDone,
}

impl CompletionKind {
    /// Catalog name of the sub-kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TaskComplete => "task-complete",
            Self::TestsPass => "tests-pass",
            Self::BuildSuccess => "build-success",
            Self::CommitMade => "commit-made",
            Self::PrCreated => "pr-created",
            Self::ExplicitDone => "explicit-done",
        }
    }
}

/// Idle sub-kinds, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdleKind {
    /// Control returned to a shell prompt.
    ShellPrompt,
    /// The agent is waiting for input.
    AgentIdle,
    /// A child process reported that it finished.
    ProcessComplete,
}

impl IdleKind {
    /// Catalog name of the sub-kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ShellPrompt => "shell-prompt",
            Self::AgentIdle => "agent-idle",
            Self::ProcessComplete => "process-complete",
        }
    }
}

/// Named category a window of output can fall into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "group", content = "kind", rename_all = "snake_case")]
pub enum PatternCategory {
    /// Something is failing.
    Error(ErrorKind),
    /// Work appears finished.
    Completion(CompletionKind),
    /// Control is waiting on someone.
    Idle(IdleKind),
}

impl PatternCategory {
    /// Catalog name of the sub-kind (e.g. `tests-pass`).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Error(kind) => kind.name(),
            Self::Completion(kind) => kind.name(),
            Self::Idle(kind) => kind.name(),
        }
    }

    /// Group the category belongs to.
    #[must_use]
    pub fn group(self) -> PatternGroup {
        match self {
            Self::Error(_) => PatternGroup::Error,
            Self::Completion(_) => PatternGroup::Completion,
            Self::Idle(_) => PatternGroup::Idle,
        }
    }
}

impl Display for PatternCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group(), self.name())
    }
}

/// Priority group of a category. Declared in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternGroup {
    /// Evaluated first.
    Error,
    /// Evaluated second.
    Completion,
    /// Evaluated last.
    Idle,
}

impl Display for PatternGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Completion => "completion",
            Self::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Source rules for one category.
#[derive(Debug)]
pub struct CategoryRules {
    /// Category reported when any pattern matches.
    pub category: PatternCategory,
    /// Regular expressions; any match wins.
    pub patterns: &'static [&'static str],
}

/// Source rules for one priority group.
#[derive(Debug)]
pub struct GroupRules {
    /// Group identity.
    pub group: PatternGroup,
    /// Categories within the group, in evaluation order.
    pub categories: &'static [CategoryRules],
}

/// The built-in rule table.
pub static BUILTIN_RULES: &[GroupRules] = &[
    GroupRules {
        group: PatternGroup::Error,
        categories: &[
            CategoryRules {
                category: PatternCategory::Error(ErrorKind::Compile),
                patterns: &[
                    r"error\[E\d{4}\]",
                    r"error TS\d+:",
                    r"\bSyntaxError:",
                    r"(?i)could not compile",
                    r"(?i)compilation failed",
                    r"(?i)cannot find (?:symbol|module|value|type|function)",
                    r"(?i)undefined reference to",
                    r"(?m)^[^\s:]+:\d+:\d+: (?:fatal )?error:",
                ],
            },
            CategoryRules {
                category: PatternCategory::Error(ErrorKind::Test),
                patterns: &[
                    r"\b[1-9]\d* (?:tests? )?failed\b",
                    r"\b[1-9]\d* failing\b",
                    r"test result: FAILED",
                    r"(?m)^\s*FAIL\s",
                    r"\bAssertionError\b",
                    r"(?i)assertion (?:`[^`]*` )?failed",
                ],
            },
            CategoryRules {
                category: PatternCategory::Error(ErrorKind::Runtime),
                patterns: &[
                    r"Traceback \(most recent call last\)",
                    r"panicked at",
                    r"(?i)segmentation fault",
                    r"Uncaught (?:\w+)?(?:Error|Exception)",
                    r"(?i)unhandled (?:promise )?rejection",
                    r"(?m)^\w*(?:Type|Reference|Range|Value|Key|Index|Attribute|Runtime)Error:",
                    r"(?m)^Exception in thread",
                ],
            },
            CategoryRules {
                category: PatternCategory::Error(ErrorKind::Permission),
                patterns: &[
                    r"(?i)permission denied",
                    r"\bEACCES\b",
                    r"\bEPERM\b",
                    r"(?i)operation not permitted",
                    r"(?i)access (?:is )?denied",
                ],
            },
        ],
    },
    GroupRules {
        group: PatternGroup::Completion,
        categories: &[
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::TaskComplete),
                patterns: &[
                    r"\bTASK_COMPLETE\b",
                    r"(?i)\btask (?:is |has been )?(?:complete|completed|finished)\b",
                    r"(?i)\b(?:all|the) (?:tasks?|work) (?:is |are |has been |have been )?(?:complete|completed|finished)\b",
                ],
            },
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::TestsPass),
                patterns: &[
                    r"\b\d+ passed\b",
                    r"(?i)all tests pass(?:ed)?",
                    r"test result: ok\.",
                ],
            },
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::BuildSuccess),
                patterns: &[
                    r"(?i)build succeeded",
                    r"(?i)\bbuild (?:was )?successful\b",
                    r"(?i)compiled successfully",
                    r"Finished `?(?:dev|release|test)`? (?:profile|\[)",
                ],
            },
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::CommitMade),
                patterns: &[
                    r"(?m)^\[[^\]\s]+(?: \(root-commit\))? [0-9a-f]{7,40}\] ",
                    r"(?i)created commit [0-9a-f]{7,40}",
                ],
            },
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::PrCreated),
                patterns: &[
                    r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+",
                    r"(?i)pull request (?:#\d+ )?(?:created|opened)",
                    r"(?i)created pull request",
                ],
            },
            CategoryRules {
                category: PatternCategory::Completion(CompletionKind::ExplicitDone),
                patterns: &[
                    r"(?i)\b(?:i'?m|i am|i've|i have) (?:all |now )?(?:done|finished)\b",
                    r"(?im)^\s*done[.!]?\s*$",
                    r"(?i)\bdone!",
                ],
            },
        ],
    },
    GroupRules {
        group: PatternGroup::Idle,
        categories: &[
            CategoryRules {
                category: PatternCategory::Idle(IdleKind::ShellPrompt),
                patterns: &[r"(?:^|\n)[^\n]{0,80}[$#%>❯]\s*\z"],
            },
            CategoryRules {
                category: PatternCategory::Idle(IdleKind::AgentIdle),
                patterns: &[
                    r"(?i)waiting for (?:your )?(?:input|instructions)",
                    r"(?i)what would you like (?:me )?to do",
                    r"(?i)how can i help",
                    r"(?i)anything else\?",
                ],
            },
            CategoryRules {
                category: PatternCategory::Idle(IdleKind::ProcessComplete),
                patterns: &[
                    r"(?i)process (?:exited|completed|finished)",
                    r"(?i)command finished",
                ],
            },
        ],
    },
];

#[derive(Debug)]
struct CompiledCategory {
    category: PatternCategory,
    set: RegexSet,
}

#[derive(Debug)]
struct CompiledGroup {
    group: PatternGroup,
    categories: Vec<CompiledCategory>,
}

/// Compiled form of a rule table.
///
/// Built once at startup and shared by reference; matching never allocates
/// regexes.
#[derive(Debug)]
pub struct PatternCatalog {
    version: u32,
    groups: Vec<CompiledGroup>,
}

impl PatternCatalog {
    /// Compile the built-in rule table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a rule fails to compile.
    pub fn builtin() -> Result<Self> {
        Self::compile(CATALOG_VERSION, BUILTIN_RULES)
    }

    /// Compile an arbitrary rule table.
    ///
    /// Groups are sorted into error, completion, idle order regardless of
    /// how the table lists them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a rule fails to compile.
    pub fn compile(version: u32, rules: &[GroupRules]) -> Result<Self> {
        let mut groups = Vec::with_capacity(rules.len());
        for group in rules {
            let mut categories = Vec::with_capacity(group.categories.len());
            for rule in group.categories {
                if rule.category.group() != group.group {
                    return Err(AppError::Config(format!(
                        "pattern category {} listed under group {}",
                        rule.category, group.group
                    )));
                }
                let set = RegexSet::new(rule.patterns).map_err(|err| {
                    AppError::Config(format!("invalid pattern for {}: {err}", rule.category))
                })?;
                categories.push(CompiledCategory {
                    category: rule.category,
                    set,
                });
            }
            groups.push(CompiledGroup {
                group: group.group,
                categories,
            });
        }
        groups.sort_by_key(|g| g.group);
        Ok(Self { version, groups })
    }

    /// Version of the compiled table.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// First matching category in priority order.
    ///
    /// `text` must already be free of terminal escapes.
    #[must_use]
    pub fn find(&self, text: &str) -> Option<PatternCategory> {
        self.groups
            .iter()
            .flat_map(|g| g.categories.iter())
            .find(|c| c.set.is_match(text))
            .map(|c| c.category)
    }

    /// All categories in evaluation order.
    pub fn categories(&self) -> impl Iterator<Item = PatternCategory> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.categories.iter().map(|c| c.category))
    }
}
