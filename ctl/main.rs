#![forbid(unsafe_code)]

//! `agent-shepherd-ctl`: local CLI companion for `agent-shepherd`.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "agent-shepherd-ctl",
    about = "Local CLI for the agent-shepherd daemon",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "agent-shepherd")]
    ipc_name: String,

    /// File holding the daemon's auth token (`<state_dir>/ipc.token`).
    #[arg(long)]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions with their activity and workload.
    List,

    /// List every task.
    Tasks,

    /// Write a line to a session now.
    Send {
        /// Target session.
        session: String,
        /// Text to write.
        text: String,
    },

    /// Schedule a recurring check-in.
    Check {
        /// Target session.
        session: String,
        /// Seconds between check-ins.
        #[arg(long)]
        every: u64,
        /// Message template; `{session}` and `{now}` are expanded.
        text: String,
    },

    /// Schedule a one-shot message.
    Remind {
        /// Target session.
        session: String,
        /// Seconds from now.
        #[arg(long = "in", value_name = "SECONDS", conflicts_with = "at")]
        delay: Option<u64>,
        /// RFC 3339 delivery time.
        #[arg(long)]
        at: Option<String>,
        /// Message text.
        text: String,
    },

    /// Cancel a scheduled check or message.
    Cancel {
        /// Entry id.
        id: String,
    },

    /// List scheduled checks and messages.
    Schedules,

    /// Queue a task.
    Enqueue {
        /// Project queue key.
        #[arg(long)]
        project: String,
        /// Short title.
        title: String,
        /// Full instructions.
        #[arg(long, default_value = "")]
        description: String,
        /// Role allowed to take the task.
        #[arg(long)]
        role: Option<String>,
        /// Priority: low, normal, high or critical.
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Deliverable path relative to the agent's working directory.
        #[arg(long)]
        output_path: Option<String>,
        /// Output schema as inline JSON.
        #[arg(long)]
        schema: Option<String>,
    },

    /// Submit a deliverable for a held task.
    Submit {
        /// Task id.
        task_id: String,
        /// Session holding the task.
        session: String,
        /// Deliverable as inline JSON.
        output: String,
    },

    /// Move a blocked task back to the queue.
    Reopen {
        /// Task id.
        task_id: String,
    },

    /// Kill a session.
    Kill {
        /// Target session.
        session: String,
    },
}

fn parse_json(label: &str, raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Error: {label} is not valid JSON: {err}");
            std::process::exit(2);
        }
    }
}

fn build_request(command: &Command) -> Value {
    match command {
        Command::List => json!({ "command": "list" }),
        Command::Tasks => json!({ "command": "tasks" }),
        Command::Schedules => json!({ "command": "schedules" }),
        Command::Send { session, text } => {
            json!({ "command": "send", "session": session, "text": text })
        }
        Command::Check {
            session,
            every,
            text,
        } => json!({
            "command": "check",
            "session": session,
            "interval_seconds": every,
            "text": text,
        }),
        Command::Remind {
            session,
            delay,
            at,
            text,
        } => {
            let mut req = json!({ "command": "remind", "session": session, "text": text });
            if let Some(delay) = delay {
                req["delay_seconds"] = json!(delay);
            }
            if let Some(at) = at {
                req["at"] = Value::String(at.clone());
            }
            req
        }
        Command::Cancel { id } => json!({ "command": "cancel", "id": id }),
        Command::Enqueue {
            project,
            title,
            description,
            role,
            priority,
            output_path,
            schema,
        } => {
            let mut task = json!({
                "queue_key": project,
                "title": title,
                "description": description,
                "priority": priority,
            });
            if let Some(role) = role {
                task["required_role"] = Value::String(role.clone());
            }
            if let Some(path) = output_path {
                task["output_path"] = Value::String(path.clone());
            }
            if let Some(schema) = schema {
                task["output_schema"] = parse_json("--schema", schema);
            }
            json!({ "command": "enqueue", "task": task })
        }
        Command::Submit {
            task_id,
            session,
            output,
        } => json!({
            "command": "submit",
            "task_id": task_id,
            "session": session,
            "output": parse_json("output", output),
        }),
        Command::Reopen { task_id } => json!({ "command": "reopen", "task_id": task_id }),
        Command::Kill { session } => json!({ "command": "kill", "session": session }),
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = build_request(&args.command);
    if let Some(path) = &args.token_file {
        match std::fs::read_to_string(path) {
            Ok(token) => request_json["auth_token"] = Value::String(token.trim().to_owned()),
            Err(err) => {
                eprintln!("Error: cannot read token file {}: {err}", path.display());
                std::process::exit(2);
            }
        }
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj.get("ok").and_then(Value::as_bool).unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to daemon: {err}");
            eprintln!("Is agent-shepherd running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &Value,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
