//! 対話型コントローラ
//!
//! デバッグ対象からの接続を受け、REPLで入力したコマンドをプロトコルに変換します。

use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tansa_core::{DebugEvent, SuspendPolicy};
use tansa_proto::{write_message, Message, MessageReader, Request, Response};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
const HISTORY_FILE: &str = ".tansa_history";

/// コンソールのコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定（`file:line` または `file:function`）
    Break {
        location: String,
        condition: Option<String>,
    },
    /// ブレークポイントを削除
    Clear(u64),
    /// 例外で停止
    Catch(String),
    Threads,
    Stack,
    /// 現在のフレームを切り替える
    Frame(usize),
    Vars(Vec<String>),
    Eval(String),
    Set { name: String, value: String },
    Step,
    Next,
    Finish,
    Continue,
    Pause,
    Detach,
    Help,
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (head, rest) = match input.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (input, ""),
        };

        match head {
            "break" | "b" if !rest.is_empty() => {
                let (location, condition) = match rest.split_once(" if ") {
                    Some((location, condition)) => {
                        (location.trim(), Some(condition.trim().to_string()))
                    }
                    None => (rest, None),
                };
                Some(Command::Break {
                    location: location.to_string(),
                    condition,
                })
            }
            "clear" | "delete" | "d" => rest.parse().ok().map(Command::Clear),
            "catch" if !rest.is_empty() => Some(Command::Catch(rest.to_string())),
            "threads" | "t" if rest.is_empty() => Some(Command::Threads),
            "stack" | "backtrace" | "bt" if rest.is_empty() => Some(Command::Stack),
            "frame" | "f" => rest.parse().ok().map(Command::Frame),
            "vars" | "locals" | "l" => Some(Command::Vars(
                rest.split('.')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            "eval" | "p" | "print" if !rest.is_empty() => Some(Command::Eval(rest.to_string())),
            "set" => {
                let (name, value) = rest.split_once('=')?;
                let name = name.trim();
                let value = value.trim();
                if name.is_empty() || value.is_empty() {
                    return None;
                }
                Some(Command::Set {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            }
            "step" | "s" if rest.is_empty() => Some(Command::Step),
            "next" | "n" if rest.is_empty() => Some(Command::Next),
            "finish" if rest.is_empty() => Some(Command::Finish),
            "continue" | "c" if rest.is_empty() => Some(Command::Continue),
            "pause" if rest.is_empty() => Some(Command::Pause),
            "detach" if rest.is_empty() => Some(Command::Detach),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// `file:line` / `file:function` を分解する
fn parse_location(location: &str) -> Result<(String, Option<u32>, Option<String>)> {
    let (file, target) = location
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected file:line or file:function, got '{}'", location))?;
    if file.is_empty() || target.is_empty() {
        bail!("expected file:line or file:function, got '{}'", location);
    }
    match target.parse::<u32>() {
        Ok(line) => Ok((file.to_string(), Some(line), None)),
        Err(_) => Ok((file.to_string(), None, Some(target.to_string()))),
    }
}

/// 最後に停止したスレッドの情報
#[derive(Debug, Clone, Copy)]
struct Focus {
    thread_id: u64,
    epoch: u64,
    frame_index: usize,
}

/// 接続とREPLの状態
struct Console {
    writer: TcpStream,
    next_seq: u64,
    responses: Receiver<Response>,
    focus: Arc<Mutex<Option<Focus>>>,
}

/// 接続済みのデバッグ対象を対話的に操作する
pub fn run(stream: TcpStream) -> Result<()> {
    let writer = stream.try_clone()?;
    let (tx, rx) = channel::unbounded();
    let focus = Arc::new(Mutex::new(None));

    let reader_focus = focus.clone();
    thread::Builder::new()
        .name("tansa-console-reader".into())
        .spawn(move || read_messages(stream, tx, reader_focus))?;

    let mut console = Console {
        writer,
        next_seq: 1,
        responses: rx,
        focus,
    };
    console.repl()
}

/// 受信スレッド：イベントを表示し、応答をREPLへ渡す
fn read_messages(stream: TcpStream, responses: Sender<Response>, focus: Arc<Mutex<Option<Focus>>>) {
    let mut reader = MessageReader::new(BufReader::new(stream));
    loop {
        match reader.read_message() {
            Ok(Some(Message::Response(response))) => {
                if responses.send(response).is_err() {
                    break;
                }
            }
            Ok(Some(Message::Event { event, .. })) => {
                if let DebugEvent::ThreadSuspended {
                    thread_id, epoch, ..
                } = &event
                {
                    if let Ok(mut focus) = focus.lock() {
                        *focus = Some(Focus {
                            thread_id: *thread_id,
                            epoch: *epoch,
                            frame_index: 0,
                        });
                    }
                }
                print_event(&event);
            }
            Ok(Some(Message::Command { seq, .. })) => {
                tracing::warn!("ignoring command from debuggee (seq {})", seq)
            }
            Ok(None) => {
                println!();
                println!("Debuggee disconnected");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
}

fn print_event(event: &DebugEvent) {
    match event {
        DebugEvent::ThreadCreated { thread_id, name } => {
            println!("[thread {} '{}' started]", thread_id, name)
        }
        DebugEvent::ThreadExited { thread_id } => println!("[thread {} exited]", thread_id),
        DebugEvent::ThreadSuspended {
            thread_id,
            reason,
            location,
            breakpoint_id,
            exception,
            ..
        } => {
            println!();
            println!(
                "Thread {} stopped ({:?}) at {}:{} in {}",
                thread_id, reason, location.file, location.line, location.function
            );
            if let Some(id) = breakpoint_id {
                println!("  breakpoint {}", id);
            }
            if let Some(exception) = exception {
                println!("  {}: {}", exception.type_name, exception.message);
            }
        }
        DebugEvent::ThreadResumed { .. } => {}
        DebugEvent::ProcessOutput { text, .. } => print!("{}", text),
        DebugEvent::ProcessTerminated { exit_code } => {
            println!("Process exited with code {}", exit_code)
        }
        DebugEvent::BreakpointError {
            breakpoint_id,
            message,
        } => println!("Breakpoint {} error: {}", breakpoint_id, message),
    }
}

impl Console {
    fn repl(&mut self) -> Result<()> {
        println!("Type 'help' for available commands, 'quit' to exit.");
        println!();

        let mut rl = DefaultEditor::new()?;
        let history = history_path();
        if let Some(path) = &history {
            let _ = rl.load_history(path);
        }

        loop {
            match rl.readline("(tansa) ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    rl.add_history_entry(line)?;

                    match Command::parse(line) {
                        Some(Command::Quit) => break,
                        Some(command) => {
                            if let Err(e) = self.handle(command) {
                                eprintln!("Error: {}", e);
                            }
                        }
                        None => {
                            println!("Unknown command: {}", line);
                            println!("Type 'help' for available commands.");
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    break;
                }
            }
        }

        if let Some(path) = &history {
            let _ = rl.save_history(path);
        }
        Ok(())
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Break {
                location,
                condition,
            } => {
                let (file, line, function) = parse_location(&location)?;
                let body = self.request(Request::SetBreakpoint {
                    file,
                    line,
                    function,
                    condition,
                    hit_count: None,
                    suspend_policy: SuspendPolicy::Thread,
                    log_message: None,
                })?;
                println!("Breakpoint {} set at {}", body["id"], location);
            }
            Command::Clear(id) => {
                self.request(Request::ClearBreakpoint { id })?;
                println!("Breakpoint {} cleared", id);
            }
            Command::Catch(type_name) => {
                self.request(Request::SetExceptionBreakpoint {
                    type_name: type_name.clone(),
                    on_raise: true,
                    on_uncaught: true,
                })?;
                println!("Stopping on {}", type_name);
            }
            Command::Threads => {
                let body = self.request(Request::ListThreads)?;
                for thread in body["threads"].as_array().into_iter().flatten() {
                    println!(
                        "  {:>3} {:<16} {}",
                        thread["id"],
                        thread["name"].as_str().unwrap_or("?"),
                        thread["state"].as_str().unwrap_or("?")
                    );
                }
            }
            Command::Stack => {
                let focus = self.focus()?;
                let body = self.request(Request::GetStack {
                    thread_id: focus.thread_id,
                })?;
                for frame in body["frames"].as_array().into_iter().flatten() {
                    let marker = if frame["index"].as_u64() == Some(focus.frame_index as u64) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{} #{} {} at {}:{}",
                        marker,
                        frame["index"],
                        frame["function"].as_str().unwrap_or("?"),
                        frame["file"].as_str().unwrap_or("?"),
                        frame["line"]
                    );
                }
            }
            Command::Frame(index) => {
                let mut focus = self.focus()?;
                focus.frame_index = index;
                self.set_focus(focus);
                println!("Frame {} selected", index);
            }
            Command::Vars(path) => {
                let focus = self.focus()?;
                let body = self.request(Request::GetVariables {
                    thread_id: focus.thread_id,
                    epoch: focus.epoch,
                    frame_index: focus.frame_index,
                    path,
                    offset: 0,
                })?;
                print_variables(&body["variables"]);
            }
            Command::Eval(expression) => {
                let focus = self.focus()?;
                let body = self.request(Request::Evaluate {
                    thread_id: focus.thread_id,
                    epoch: focus.epoch,
                    frame_index: focus.frame_index,
                    expression,
                })?;
                match body["result"]["value"].as_str() {
                    Some(value) => println!("{}", value),
                    None => println!("(ok)"),
                }
            }
            Command::Set { name, value } => {
                let focus = self.focus()?;
                let body = self.request(Request::SetVariable {
                    thread_id: focus.thread_id,
                    epoch: focus.epoch,
                    frame_index: focus.frame_index,
                    name: name.clone(),
                    value,
                })?;
                println!("{} = {}", name, body["variable"]["value"].as_str().unwrap_or("?"));
            }
            Command::Step => {
                let thread_id = self.take_focus()?;
                self.request(Request::StepInto { thread_id })?;
            }
            Command::Next => {
                let thread_id = self.take_focus()?;
                self.request(Request::StepOver { thread_id })?;
            }
            Command::Finish => {
                let thread_id = self.take_focus()?;
                self.request(Request::StepReturn { thread_id })?;
            }
            Command::Continue => {
                let thread_id = self.take_focus().ok();
                self.request(Request::Resume { thread_id })?;
                println!("Continuing execution...");
            }
            Command::Pause => {
                self.request(Request::Pause { thread_id: None })?;
            }
            Command::Detach => {
                self.request(Request::Detach)?;
                println!("Detached");
            }
            Command::Help => print_help(),
            Command::Quit => {}
        }
        Ok(())
    }

    /// コマンドを送り、応答の本体を返す
    fn request(&mut self, request: Request) -> Result<Value> {
        let seq = self.next_seq;
        self.next_seq += 2;
        write_message(&mut self.writer, &Message::Command { seq, request })?;

        loop {
            let response = match self.responses.recv_timeout(RESPONSE_TIMEOUT) {
                Ok(response) => response,
                Err(RecvTimeoutError::Timeout) => bail!("no response from debuggee"),
                Err(RecvTimeoutError::Disconnected) => bail!("debuggee disconnected"),
            };
            if response.seq != seq {
                tracing::debug!("discarding late response {}", response.seq);
                continue;
            }
            if response.success {
                return Ok(response.body.unwrap_or(Value::Null));
            }
            return match response.error {
                Some(error) => Err(anyhow!("{} ({})", error.message, error.kind)),
                None => Err(anyhow!("request failed")),
            };
        }
    }

    fn focus(&self) -> Result<Focus> {
        self.focus
            .lock()
            .map_err(|_| anyhow!("console state poisoned"))?
            .ok_or_else(|| anyhow!("no stopped thread"))
    }

    fn set_focus(&self, focus: Focus) {
        if let Ok(mut current) = self.focus.lock() {
            *current = Some(focus);
        }
    }

    /// 再開するスレッドを取り出す（以後のフレーム参照は無効）
    fn take_focus(&self) -> Result<u64> {
        let mut focus = self
            .focus
            .lock()
            .map_err(|_| anyhow!("console state poisoned"))?;
        focus
            .take()
            .map(|f| f.thread_id)
            .ok_or_else(|| anyhow!("no stopped thread"))
    }
}

fn print_variables(nodes: &Value) {
    for node in nodes.as_array().into_iter().flatten() {
        print_node(node, 1);
    }
}

fn print_node(node: &Value, indent: usize) {
    let mut line = format!(
        "{:width$}{}: {} = {}",
        "",
        node["name"].as_str().unwrap_or("?"),
        node["type_name"].as_str().unwrap_or("?"),
        node["value"].as_str().unwrap_or(""),
        width = indent * 2
    );
    if node["cycle"].as_bool() == Some(true) {
        line.push_str(" (cycle)");
    }
    if node["truncated"].as_bool() == Some(true) {
        line.push_str(" ...");
    }
    println!("{}", line);
    for child in node["children"].as_array().into_iter().flatten() {
        print_node(child, indent + 1);
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(HISTORY_FILE))
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help              - Show this help message");
    println!("  quit/exit/q       - Exit the console");
    println!();
    println!("Breakpoints:");
    println!("  break <file:line> [if <cond>]     - Set a line breakpoint");
    println!("  break <file:function> [if <cond>] - Set a function breakpoint");
    println!("  clear <id>        - Remove a breakpoint");
    println!("  catch <Exception> - Stop when the exception is raised");
    println!();
    println!("Inspection:");
    println!("  threads (t)       - List threads");
    println!("  stack (bt)        - Show the stack of the stopped thread");
    println!("  frame <n>         - Select a frame");
    println!("  vars [a.b]        - Show variables (optionally a nested path)");
    println!("  eval <code>       - Evaluate an expression or statement");
    println!("  set <name> = <expr> - Assign a variable");
    println!();
    println!("Execution:");
    println!("  step (s)          - Step into");
    println!("  next (n)          - Step over");
    println!("  finish            - Run until the current function returns");
    println!("  continue (c)      - Resume");
    println!("  pause             - Suspend all threads");
    println!("  detach            - Disconnect and let the debuggee run");
    println!();
    println!("Examples:");
    println!("  break app.src:12 if count > 3");
    println!("  vars items.0");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_break() {
        assert_eq!(
            Command::parse("break a.src:10"),
            Some(Command::Break {
                location: "a.src:10".into(),
                condition: None
            })
        );
        assert_eq!(
            Command::parse("b a.src:10 if x > 1"),
            Some(Command::Break {
                location: "a.src:10".into(),
                condition: Some("x > 1".into())
            })
        );
        assert_eq!(Command::parse("break"), None);
    }

    #[test]
    fn test_parse_basic() {
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("next"), Some(Command::Next));
        assert_eq!(Command::parse("clear 3"), Some(Command::Clear(3)));
        assert_eq!(Command::parse("clear x"), None);
        assert_eq!(
            Command::parse("vars items.0"),
            Some(Command::Vars(vec!["items".into(), "0".into()]))
        );
        assert_eq!(Command::parse("eval x + 1"), Some(Command::Eval("x + 1".into())));
        assert_eq!(
            Command::parse("set x = 5"),
            Some(Command::Set {
                name: "x".into(),
                value: "5".into()
            })
        );
        assert_eq!(Command::parse("unknown"), None);
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(
            parse_location("dir/a.src:10").unwrap(),
            ("dir/a.src".to_string(), Some(10), None)
        );
        assert_eq!(
            parse_location("a.src:main").unwrap(),
            ("a.src".to_string(), None, Some("main".to_string()))
        );
        assert!(parse_location("a.src").is_err());
        assert!(parse_location(":10").is_err());
    }
}
