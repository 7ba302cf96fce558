//! コマンドのディスパッチ
//!
//! 受信したコマンドを [`Debugger`] の操作に変換し、応答を送信キューに積みます。
//! フレームに触れるコマンドは停止中のスレッド上で実行され、応答はそのスレッドから
//! 直接送信されます。

use crate::codec::{ProtocolError, SequenceCheck};
use crate::message::{Request, Response, PROTOCOL_VERSION};
use crate::transport::Outbox;
use serde_json::{json, Value};
use std::sync::Arc;
use tansa_core::{BreakpointSpec, DebugError, Debugger, DetachReason, FrameHandle};

/// コマンドディスパッチャ
pub struct Dispatcher {
    debugger: Arc<Debugger>,
    outbox: Outbox,
    sequence: SequenceCheck,
}

impl Dispatcher {
    pub fn new(debugger: Arc<Debugger>, outbox: Outbox) -> Self {
        Self {
            debugger,
            outbox,
            sequence: SequenceCheck::new(),
        }
    }

    /// 1つのコマンドを処理する
    ///
    /// `seq` の順序違反はエラー応答を送ったうえで `Err` を返し、接続は閉じられます。
    pub fn handle(&mut self, seq: u64, request: Request) -> Result<(), ProtocolError> {
        if let Err(err) = self.sequence.accept(seq) {
            tracing::warn!("rejecting {}: {}", request.name(), err);
            self.outbox
                .respond(Response::error(seq, err.kind(), err.to_string()));
            return Err(err);
        }
        tracing::debug!("command {} (seq {})", request.name(), seq);

        if let Some(response) = self.execute(seq, request) {
            self.outbox.respond(response);
        }
        Ok(())
    }

    /// コマンドの実行を経ずに応答を送る
    pub fn reply(&self, response: Response) {
        self.outbox.respond(response);
    }

    /// 応答を返す（非同期に応答するコマンドは `None`）
    fn execute(&self, seq: u64, request: Request) -> Option<Response> {
        let debugger = &self.debugger;
        let response = match request {
            Request::Version => Response::ok(
                seq,
                json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol": PROTOCOL_VERSION,
                    "runtime": debugger.runtime().name(),
                    "interception": debugger.mode(),
                }),
            ),

            Request::SetBreakpoint {
                file,
                line,
                function,
                condition,
                hit_count,
                suspend_policy,
                log_message,
            } => {
                let mut spec = match (line, function) {
                    (Some(line), None) => BreakpointSpec::line(file, line),
                    (None, Some(function)) => BreakpointSpec::function(file, function),
                    _ => {
                        return Some(Response::from_result::<()>(
                            seq,
                            Err(DebugError::InvalidBreakpoint(
                                "exactly one of line or function is required".into(),
                            )),
                        ))
                    }
                };
                spec.condition = condition;
                spec.hit_count = hit_count;
                spec.suspend_policy = suspend_policy;
                spec.log_message = log_message;
                Response::from_result(seq, debugger.set_breakpoint(spec))
            }

            Request::ClearBreakpoint { id } => Response::from_result(
                seq,
                debugger.clear_breakpoint(id).map(|()| json!({ "id": id })),
            ),

            Request::ClearFileBreakpoints { file } => Response::from_result(
                seq,
                debugger
                    .clear_file_breakpoints(&file)
                    .map(|ids| json!({ "cleared": ids })),
            ),

            Request::SetExceptionBreakpoint {
                type_name,
                on_raise,
                on_uncaught,
            } => Response::from_result(
                seq,
                debugger.set_exception_breakpoint(&type_name, on_raise, on_uncaught),
            ),

            Request::ClearExceptionBreakpoint { type_name } => {
                Response::from_result(seq, debugger.clear_exception_breakpoint(&type_name))
            }

            Request::ListBreakpoints => {
                let (breakpoints, exceptions) = debugger.breakpoints();
                Response::ok(
                    seq,
                    json!({
                        "breakpoints": breakpoints,
                        "exception_breakpoints": exceptions,
                    }),
                )
            }

            Request::ListThreads => Response::ok(seq, json!({ "threads": debugger.list_threads() })),

            Request::GetStack { thread_id } => {
                Response::from_result(seq, debugger.get_stack(thread_id))
            }

            Request::GetVariables {
                thread_id,
                epoch,
                frame_index,
                path,
                offset,
            } => {
                let handle = FrameHandle {
                    thread_id,
                    epoch,
                    frame_index,
                };
                let outbox = self.outbox.clone();
                let submitted = debugger.get_variables(
                    handle,
                    path,
                    offset,
                    Box::new(move |result| {
                        outbox.respond(Response::from_result(
                            seq,
                            result.map(|variables| json!({ "variables": variables })),
                        ))
                    }),
                );
                submitted.err().map(|err| Response::from_result::<()>(seq, Err(err)))?
            }

            Request::GetCustomFrameVariables {
                frame_id,
                path,
                offset,
            } => Response::from_result(
                seq,
                debugger
                    .get_custom_frame_variables(frame_id, &path, offset)
                    .map(|variables| json!({ "variables": variables })),
            ),

            Request::Evaluate {
                thread_id,
                epoch,
                frame_index,
                expression,
            } => {
                let handle = FrameHandle {
                    thread_id,
                    epoch,
                    frame_index,
                };
                let outbox = self.outbox.clone();
                let submitted = debugger.evaluate(
                    handle,
                    expression,
                    Box::new(move |result| {
                        outbox.respond(Response::from_result(
                            seq,
                            result.map(|node| json!({ "result": node })),
                        ))
                    }),
                );
                submitted.err().map(|err| Response::from_result::<()>(seq, Err(err)))?
            }

            Request::SetVariable {
                thread_id,
                epoch,
                frame_index,
                name,
                value,
            } => {
                let handle = FrameHandle {
                    thread_id,
                    epoch,
                    frame_index,
                };
                let outbox = self.outbox.clone();
                let submitted = debugger.set_variable(
                    handle,
                    name,
                    value,
                    Box::new(move |result| {
                        outbox.respond(Response::from_result(
                            seq,
                            result.map(|node| json!({ "variable": node })),
                        ))
                    }),
                );
                submitted.err().map(|err| Response::from_result::<()>(seq, Err(err)))?
            }

            Request::StepInto { thread_id } => {
                Response::from_result(seq, debugger.step_into(thread_id).map(|()| empty()))
            }
            Request::StepOver { thread_id } => {
                Response::from_result(seq, debugger.step_over(thread_id).map(|()| empty()))
            }
            Request::StepReturn { thread_id } => {
                Response::from_result(seq, debugger.step_return(thread_id).map(|()| empty()))
            }

            Request::Resume { thread_id } => Response::from_result(
                seq,
                debugger
                    .resume(thread_id)
                    .map(|ids| json!({ "threads": ids })),
            ),

            Request::Pause { thread_id } => Response::from_result(
                seq,
                debugger.pause(thread_id).map(|ids| json!({ "threads": ids })),
            ),

            Request::KillThread { thread_id } => {
                Response::from_result(seq, debugger.kill_thread(thread_id).map(|()| empty()))
            }

            Request::Detach => {
                // 応答を送信キューに積んでからデタッチする
                self.outbox.respond(Response::ok(seq, empty()));
                debugger.detach(DetachReason::Requested);
                return None;
            }
        };
        Some(response)
    }
}

fn empty() -> Value {
    Value::Object(Default::default())
}
