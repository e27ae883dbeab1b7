// Integration tests for event dispatch into configuration scripts

use cybermon_config::{ErrorPolicy, ScriptingConfig};
use cybermon_engine::{ContextRef, MemoryEngine, Protocol};
use cybermon_lua::{BridgeError, CallbackDispatcher, Dispatch, MarshallingError};
use std::collections::BTreeMap;
use std::sync::Arc;

fn dispatcher(source: &str) -> CallbackDispatcher {
    dispatcher_with(ScriptingConfig::new("inline.lua"), source)
}

fn dispatcher_with(config: ScriptingConfig, source: &str) -> CallbackDispatcher {
    CallbackDispatcher::from_source(&config, "inline", source).expect("script should load")
}

fn tcp_flow(engine: &MemoryEngine) -> ContextRef {
    engine.open_flow(
        Protocol::Tcp,
        "10.0.0.1:443".parse().unwrap(),
        "10.0.0.2:5000".parse().unwrap(),
    )
}

fn global<T: mlua::FromLua>(d: &CallbackDispatcher, name: &str) -> T {
    d.runtime().lua().globals().get::<T>(name).unwrap()
}

fn assert_balanced(d: &mut CallbackDispatcher) {
    assert_eq!(d.runtime_mut().marshaller().depth(), 0, "stack not balanced");
    assert_eq!(d.runtime().live_contexts(), 0, "context still live");
}

#[test]
fn test_data_handler_sees_payload() {
    let mut d = dispatcher(
        r#"
        received = {}
        function data(ctx, payload)
            received[#received + 1] = payload
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_up(&engine, &conn).unwrap(), Dispatch::NoHandler);
    assert_eq!(
        d.connection_data(&engine, &conn, &[0x41, 0x42]).unwrap(),
        Dispatch::Handled
    );

    let received: mlua::Table = global(&d, "received");
    assert_eq!(received.raw_len(), 1);
    assert_eq!(received.get::<String>(1).unwrap(), "AB");
    assert_balanced(&mut d);
}

#[test]
fn test_binary_payload_is_not_truncated() {
    let mut d = dispatcher(
        r#"
        function datagram(ctx, payload)
            size = #payload
            first, last = payload:byte(1), payload:byte(-1)
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = engine.open_flow(
        Protocol::Udp,
        "192.168.1.5:53".parse().unwrap(),
        "192.168.1.9:40000".parse().unwrap(),
    );

    let payload = [0x00, 0xff, 0x00, 0x10, 0x00];
    assert_eq!(d.datagram(&engine, &conn, &payload).unwrap(), Dispatch::Handled);

    assert_eq!(global::<i64>(&d, "size"), 5);
    assert_eq!(global::<i64>(&d, "first"), 0);
    assert_eq!(global::<i64>(&d, "last"), 0);
}

#[test]
fn test_trigger_handlers_get_plain_arguments() {
    let mut d = dispatcher(
        r#"
        function trigger_up(liid, address)
            up = { liid, address, type(liid), type(address) }
        end
        function trigger_down(liid)
            down = liid
        end
        "#,
    );

    let result = d
        .trigger_up("LIID-1", "10.0.0.1".parse().unwrap())
        .unwrap();
    assert_eq!(result, Dispatch::Handled);

    let up: mlua::Table = global(&d, "up");
    assert_eq!(up.get::<String>(1).unwrap(), "LIID-1");
    assert_eq!(up.get::<String>(2).unwrap(), "10.0.0.1");
    assert_eq!(up.get::<String>(3).unwrap(), "string");
    assert_eq!(up.get::<String>(4).unwrap(), "string");

    assert_eq!(d.trigger_down("LIID-1").unwrap(), Dispatch::Handled);
    assert_eq!(global::<String>(&d, "down"), "LIID-1");
    assert_balanced(&mut d);
}

#[test]
fn test_missing_handlers_are_no_ops() {
    let mut d = dispatcher("-- nothing here");
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);
    let headers = BTreeMap::new();

    assert_eq!(d.trigger_up("L", "::1".parse().unwrap()).unwrap(), Dispatch::NoHandler);
    assert_eq!(d.trigger_down("L").unwrap(), Dispatch::NoHandler);
    assert_eq!(d.connection_up(&engine, &conn).unwrap(), Dispatch::NoHandler);
    assert_eq!(d.connection_data(&engine, &conn, b"x").unwrap(), Dispatch::NoHandler);
    assert_eq!(d.datagram(&engine, &conn, b"x").unwrap(), Dispatch::NoHandler);
    assert_eq!(
        d.http_request(&engine, &conn, "GET", "/", &headers, b"").unwrap(),
        Dispatch::NoHandler
    );
    assert_eq!(
        d.http_response(&engine, &conn, 200, "OK", &headers, b"").unwrap(),
        Dispatch::NoHandler
    );
    assert_eq!(d.connection_down(&engine, &conn).unwrap(), Dispatch::NoHandler);
    assert_balanced(&mut d);
}

#[test]
fn test_non_function_global_is_a_call_error() {
    let mut d = dispatcher("data = 'not a function'");
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(
        d.connection_data(&engine, &conn, b"x").unwrap(),
        Dispatch::Failed
    );
    assert_balanced(&mut d);
}

#[test]
fn test_handler_return_values_are_discarded() {
    let mut d = dispatcher(
        r#"
        function connection_up(ctx)
            return 1, 2, 3
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_up(&engine, &conn).unwrap(), Dispatch::Handled);
    assert_balanced(&mut d);
}

#[test]
fn test_module_table_handlers_take_precedence() {
    let mut d = dispatcher(
        r#"
        function data(ctx, payload)
            via = "global"
        end

        return {
            data = function(ctx, payload)
                via = "config"
            end,
        }
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_data(&engine, &conn, b"x").unwrap(), Dispatch::Handled);
    assert_eq!(global::<String>(&d, "via"), "config");
    assert_balanced(&mut d);
}

#[test]
fn test_callable_table_as_handler() {
    let mut d = dispatcher(
        r#"
        local recorder = setmetatable({}, {
            __call = function(self, ctx, payload)
                got = payload
            end,
        })
        return { data = recorder }
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_data(&engine, &conn, b"AB").unwrap(), Dispatch::Handled);
    assert_eq!(global::<String>(&d, "got"), "AB");
    assert_balanced(&mut d);
}

#[test]
fn test_global_used_when_module_table_lacks_handler() {
    let mut d = dispatcher(
        r#"
        function connection_down(ctx)
            closed = true
        end
        return { name = "monitor" }
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_down(&engine, &conn).unwrap(), Dispatch::Handled);
    assert!(global::<bool>(&d, "closed"));
    assert_balanced(&mut d);
}

#[test]
fn test_http_handlers_receive_headers_and_body() {
    let mut d = dispatcher(
        r#"
        function http_request(ctx, method, url, headers, body)
            req = { method = method, url = url, host = headers["Host"], body = body }
        end
        function http_response(ctx, code, status, headers, body)
            resp = {
                code = code,
                integer = math.type(code) == "integer",
                status = status,
                ctype = headers["Content-Type"],
                body = body,
            }
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);
    let http = engine.open_layer(&conn, "http");

    let mut headers = BTreeMap::new();
    headers.insert("Host".to_string(), "example.org".to_string());
    d.http_request(&engine, &http, "POST", "/login", &headers, b"user=a")
        .unwrap();

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    d.http_response(&engine, &http, 404, "Not Found", &headers, b"")
        .unwrap();

    let req: mlua::Table = global(&d, "req");
    assert_eq!(req.get::<String>("method").unwrap(), "POST");
    assert_eq!(req.get::<String>("url").unwrap(), "/login");
    assert_eq!(req.get::<String>("host").unwrap(), "example.org");
    assert_eq!(req.get::<String>("body").unwrap(), "user=a");

    let resp: mlua::Table = global(&d, "resp");
    assert_eq!(resp.get::<i64>("code").unwrap(), 404);
    assert!(resp.get::<bool>("integer").unwrap());
    assert_eq!(resp.get::<String>("status").unwrap(), "Not Found");
    assert_eq!(resp.get::<String>("ctype").unwrap(), "text/plain");
    assert_eq!(resp.get::<String>("body").unwrap(), "");
    assert_balanced(&mut d);
}

#[test]
fn test_handler_error_is_logged_by_default() {
    let mut d = dispatcher(
        r#"
        count = 0
        function data(ctx, payload)
            count = count + 1
            error("bad payload")
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_data(&engine, &conn, b"1").unwrap(), Dispatch::Failed);
    assert_balanced(&mut d);

    // The next event is still delivered
    assert_eq!(d.connection_data(&engine, &conn, b"2").unwrap(), Dispatch::Failed);
    assert_eq!(global::<i64>(&d, "count"), 2);
    assert_balanced(&mut d);
}

#[test]
fn test_handler_error_propagates_when_configured() {
    let mut config = ScriptingConfig::new("inline.lua");
    config.error_policy = ErrorPolicy::Propagate;
    let mut d = dispatcher_with(
        config,
        r#"
        function connection_up(ctx)
            error("refusing connection")
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    match d.connection_up(&engine, &conn) {
        Err(BridgeError::Call(e)) => {
            assert_eq!(e.origin, "handler 'connection_up'");
            assert!(e.to_string().contains("refusing connection"), "{}", e);
        }
        other => panic!("expected a call error, got {:?}", other),
    }
    assert_balanced(&mut d);
}

#[test]
fn test_oversized_payload_is_rejected_before_the_call() {
    let mut config = ScriptingConfig::new("inline.lua");
    config.max_payload_bytes = 4;
    config.error_policy = ErrorPolicy::Propagate;
    let mut d = dispatcher_with(
        config,
        r#"
        called = false
        function data(ctx, payload)
            called = true
        end
        "#,
    );
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_data(&engine, &conn, b"1234").unwrap(), Dispatch::Handled);
    d.runtime().lua().globals().set("called", false).unwrap();

    let err = d.connection_data(&engine, &conn, b"12345").unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Marshalling(MarshallingError::PayloadTooLarge { len: 5, max: 4 })
    ));
    assert!(!global::<bool>(&d, "called"));
    assert_balanced(&mut d);
}

#[test]
fn test_oversized_headers_fail_dispatch() {
    let mut config = ScriptingConfig::new("inline.lua");
    config.max_table_entries = 2;
    let mut d = dispatcher_with(config, "function http_request() called = true end");
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    let headers: BTreeMap<String, String> = (0..3)
        .map(|i| (format!("X-Header-{}", i), "v".to_string()))
        .collect();
    let result = d
        .http_request(&engine, &conn, "GET", "/", &headers, b"")
        .unwrap();

    assert_eq!(result, Dispatch::Failed);
    assert!(global::<Option<bool>>(&d, "called").is_none());
    assert_balanced(&mut d);
}

#[test]
fn test_module_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitor.lua");
    std::fs::write(
        &path,
        "function connection_up(ctx) seen = cybermon.get_context_id(ctx) end",
    )
    .unwrap();

    let mut d = CallbackDispatcher::from_config(&ScriptingConfig::new(&path)).unwrap();
    let engine = Arc::new(MemoryEngine::new());
    let conn = tcp_flow(&engine);

    assert_eq!(d.connection_up(&engine, &conn).unwrap(), Dispatch::Handled);
    assert_eq!(global::<String>(&d, "seen"), conn.id().to_string());
}

#[test]
fn test_module_with_syntax_error_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.lua");
    std::fs::write(&path, "function data(ctx").unwrap();

    let err = CallbackDispatcher::from_config(&ScriptingConfig::new(&path))
        .err()
        .expect("load should fail");
    assert!(matches!(err, BridgeError::Load(_)));
    assert!(
        err.to_string().starts_with("Error running script: "),
        "{}",
        err
    );
}

#[test]
fn test_missing_module_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.lua");

    let err = CallbackDispatcher::from_config(&ScriptingConfig::new(&path))
        .err()
        .expect("load should fail");
    assert!(err.to_string().starts_with("Error running script: cannot open"));
}
