#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_agent::parse_command;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let (prefix, body) = raw.split_once('\n').unwrap_or(("/", raw.as_ref()));

    if let Some(command) = parse_command(prefix, body) {
        assert!(!command.name.is_empty());
        assert!(!command.name.chars().any(char::is_whitespace));
        assert!(command.args.iter().all(|arg| !arg.is_empty()));
    }
});
