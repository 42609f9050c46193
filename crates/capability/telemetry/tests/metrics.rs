use otgw_telemetry::{
    install_panic_hook, metrics, normalize_level, panic_message, record_command_sent,
    record_line_received, record_value_changed,
};

#[test]
fn counters_accumulate() {
    let before = metrics().snapshot();
    record_line_received();
    record_line_received();
    record_value_changed();
    record_command_sent();
    let after = metrics().snapshot();
    assert_eq!(after.lines_received - before.lines_received, 2);
    assert_eq!(after.values_changed - before.values_changed, 1);
    assert_eq!(after.commands_sent - before.commands_sent, 1);
}

#[test]
fn log_levels_are_normalized() {
    assert_eq!(normalize_level("Information"), Some("info"));
    assert_eq!(normalize_level("Warning"), Some("warn"));
    assert_eq!(normalize_level(" debug "), Some("debug"));
    assert_eq!(normalize_level("Verbose"), Some("trace"));
    assert_eq!(normalize_level("Fatal"), Some("error"));
    assert_eq!(normalize_level("loud"), None);
}

#[test]
fn panic_payloads_are_rendered() {
    let from_str: Box<dyn std::any::Any + Send> = Box::new("link task failed");
    assert_eq!(panic_message(from_str.as_ref()), "link task failed");
    let from_string: Box<dyn std::any::Any + Send> = Box::new(format!("bad frame {}", 7));
    assert_eq!(panic_message(from_string.as_ref()), "bad frame 7");
    let other: Box<dyn std::any::Any + Send> = Box::new(42_u32);
    assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
}

#[test]
fn panics_still_unwind_with_hook_installed() {
    install_panic_hook();
    let result = std::thread::spawn(|| panic!("router crashed")).join();
    let payload = result.expect_err("thread panicked");
    assert_eq!(panic_message(payload.as_ref()), "router crashed");
    let _ = std::panic::take_hook();
}
