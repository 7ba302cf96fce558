//! 実行中のスクリプトへのアタッチ
//!
//! シグナルと要求ファイルを使い、このテストプロセス自身にアタッチします。

mod common;

use common::{Controller, WAIT};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tansa_attach::{armed_path, inject, AttachAgent, AttachError};
use tansa_core::{DebugEvent, DebuggerConfig, StopReason};
use tansa_proto::{connect_and_serve, Request};
use tansa_script::{parse_program, ScriptRuntime};

const LOOP: &str = "\
done = False
while not done:
    sleep(5)
print(\"finished\")
";

#[test]
fn test_attach_to_running_script() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let address = listener.local_addr().expect("Failed to get local address").to_string();

    let runtime = ScriptRuntime::new();
    runtime.set_echo(false);
    let agent = Arc::new(AttachAgent::new(
        Arc::new(runtime.clone()),
        DebuggerConfig::default(),
    ));
    agent.arm().expect("Failed to arm attach agent");
    assert!(armed_path(std::process::id()).is_file());
    let poller = agent.clone();
    runtime.set_safepoint(Some(Arc::new(move || {
        poller.poll();
    })));

    let program = parse_program("loop.src", LOOP).expect("Failed to parse script");
    let script = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.run_main(&program))
    };

    // スクリプトはデバッガなしで動いている
    assert!(!agent.is_attached());
    inject(std::process::id(), &address, WAIT).expect("attach failed");
    let (stream, _) = listener.accept().expect("Failed to accept debuggee");
    let mut controller = Controller::new(stream);
    assert!(agent.is_attached());

    let threads = controller.request(Request::ListThreads);
    let threads = threads["threads"].as_array().expect("threads");
    assert!(!threads.is_empty());
    assert!(threads.iter().any(|t| t["name"] == "MainThread" && t["state"] == "running"));

    // 2回目のアタッチは拒否される
    match inject(std::process::id(), &address, WAIT) {
        Err(AttachError::Rejected(message)) => assert_eq!(message, "already attached"),
        other => panic!("expected rejection, got {:?}", other),
    }

    controller.request(Request::Pause { thread_id: None });
    let stop = controller.wait_stop();
    assert_eq!(stop.reason, StopReason::Pause);
    assert_eq!(stop.function, "<module>");

    controller.request(Request::Evaluate {
        thread_id: stop.thread_id,
        epoch: stop.epoch,
        frame_index: 0,
        expression: "done = True".into(),
    });
    controller.resume(stop.thread_id);
    controller.request(Request::Detach);
    controller.wait_closed();

    script
        .join()
        .expect("script thread panicked")
        .expect("script failed");
    assert!(!agent.is_attached());

    // 起動時に接続したセッションを引き受けた場合も重複アタッチは拒否される
    runtime.set_safepoint(None);
    let session = connect_and_serve(
        Arc::new(runtime.clone()),
        DebuggerConfig::default(),
        &address,
    )
    .expect("Failed to connect debuggee");
    let (stream, _) = listener.accept().expect("Failed to accept debuggee");
    let mut controller = Controller::new(stream);
    agent.adopt(session);
    assert!(agent.is_attached());

    let polling = Arc::new(AtomicBool::new(true));
    let poll_thread = {
        let agent = agent.clone();
        let polling = polling.clone();
        thread::spawn(move || {
            while polling.load(Ordering::Acquire) {
                agent.poll();
                thread::sleep(Duration::from_millis(10));
            }
        })
    };
    match inject(std::process::id(), &address, WAIT) {
        Err(AttachError::Rejected(message)) => assert_eq!(message, "already attached"),
        other => panic!("expected rejection, got {:?}", other),
    }
    polling.store(false, Ordering::Release);
    poll_thread.join().expect("poll thread panicked");

    agent.process_exiting(0);
    let terminated = controller.wait_event(|e| {
        matches!(e, DebugEvent::ProcessTerminated { .. })
    });
    assert_eq!(terminated, DebugEvent::ProcessTerminated { exit_code: 0 });
    controller.wait_closed();

    // エージェントが無くなると導入済みファイルも消える
    drop(agent);
    assert!(!armed_path(std::process::id()).exists());
}
