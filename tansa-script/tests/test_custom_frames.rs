//! カスタムフレームの公開
//!
//! レジストリはプロセス全体で共有されるため、他のセッションテストとは別のバイナリにしています。

mod common;

use common::attach;
use std::sync::Arc;
use tansa_core::{
    CompiledCode, CustomFrame, CustomFrameRegistry, EvalError, HostFrame, Scope, ValueHandle,
};
use tansa_proto::Request;
use tansa_script::Value;

/// テンプレートの描画中を模したフレーム
struct TemplateFrame {
    vars: Vec<(String, Value)>,
}

impl HostFrame for TemplateFrame {
    fn file(&self) -> &str {
        "page.tmpl"
    }

    fn line(&self) -> u32 {
        3
    }

    fn function(&self) -> &str {
        "render"
    }

    fn back(&self) -> Option<&dyn HostFrame> {
        None
    }

    fn variables(&self, scope: Scope) -> Vec<(String, ValueHandle)> {
        match scope {
            Scope::Local => self
                .vars
                .iter()
                .map(|(name, value)| (name.clone(), value.handle()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn evaluate(&self, _source: &str) -> Result<Option<ValueHandle>, EvalError> {
        Err(EvalError::new("Unsupported", "templates cannot evaluate"))
    }

    fn evaluate_compiled(&self, _code: &dyn CompiledCode) -> Result<ValueHandle, EvalError> {
        Err(EvalError::new("Unsupported", "templates cannot evaluate"))
    }
}

#[test]
fn test_custom_frame_is_listed_and_inspected() {
    let (mut controller, _debuggee) = attach("x = 1\n");

    let frame: Arc<dyn CustomFrame> = Arc::new(TemplateFrame {
        vars: vec![
            ("title".into(), Value::str("Home")),
            ("items".into(), Value::list(vec![Value::Int(1), Value::Int(2)])),
        ],
    });
    let id = CustomFrameRegistry::global().add("page.tmpl", &frame, None);

    let threads = controller.request(Request::ListThreads);
    let entry = threads["threads"]
        .as_array()
        .expect("threads")
        .iter()
        .find(|t| t["id"].as_u64() == Some(id))
        .cloned()
        .expect("custom frame not listed");
    assert_eq!(entry["kind"], "custom_frame");
    assert_eq!(entry["name"], "page.tmpl");
    assert_eq!(entry["state"], "suspended");
    assert_eq!(entry["location"]["line"], 3);

    let stack = controller.request(Request::GetStack { thread_id: id });
    assert_eq!(stack["frames"][0]["function"], "render");
    assert_eq!(stack["frames"][0]["file"], "page.tmpl");

    let vars = controller.request(Request::GetCustomFrameVariables {
        frame_id: id,
        path: Vec::new(),
        offset: 0,
    });
    let vars = vars["variables"].as_array().expect("variables");
    let title = vars.iter().find(|v| v["name"] == "title").expect("title");
    assert_eq!(title["value"], "\"Home\"");

    let children = controller.request(Request::GetCustomFrameVariables {
        frame_id: id,
        path: vec!["items".into()],
        offset: 1,
    });
    let children = children["variables"].as_array().expect("children");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["name"], "1");
    assert_eq!(children[0]["value"], "2");

    // 所有者が破棄したフレームは一覧から消える
    drop(frame);
    let threads = controller.request(Request::ListThreads);
    assert!(threads["threads"]
        .as_array()
        .expect("threads")
        .iter()
        .all(|t| t["id"].as_u64() != Some(id)));
    let kind = controller.request_error(Request::GetCustomFrameVariables {
        frame_id: id,
        path: Vec::new(),
        offset: 0,
    });
    assert_eq!(kind, "unknown_custom_frame");
}
