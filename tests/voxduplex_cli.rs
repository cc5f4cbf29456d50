use std::process::Command;

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

fn voxduplex_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_voxduplex").expect("voxduplex test binary not built")
}

fn voxduplex() -> Command {
    let mut command = Command::new(voxduplex_bin());
    command
        .env_remove("VOXDUPLEX_API_KEY")
        .env_remove("VOXDUPLEX_LOGS")
        .env_remove("VOXDUPLEX_NO_LOGS");
    command
}

#[test]
fn voxduplex_help_mentions_name() {
    let output = voxduplex()
        .arg("--help")
        .output()
        .expect("run voxduplex --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("voxduplex"));
    assert!(combined.contains("--interrupt-mode"));
}

#[test]
fn voxduplex_list_input_devices_uses_test_override() {
    let output = voxduplex()
        .arg("--list-input-devices")
        .env("VOXDUPLEX_TEST_DEVICES", "Desk Mic, Headset")
        .output()
        .expect("run voxduplex --list-input-devices");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("Available audio input devices:"));
    assert!(combined.contains("[0] Desk Mic (1 channel)"));
    assert!(combined.contains("[1] Headset (1 channel)"));
}

#[test]
fn voxduplex_list_input_devices_reports_empty_scan() {
    let output = voxduplex()
        .arg("--list-input-devices")
        .env("VOXDUPLEX_TEST_DEVICES", "")
        .output()
        .expect("run voxduplex --list-input-devices");
    assert!(output.status.success());
    assert!(combined_output(&output).contains("No audio input devices detected."));
}

#[test]
fn voxduplex_requires_api_key() {
    let output = voxduplex()
        .output()
        .expect("run voxduplex without an API key");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("an API key is required"));
}

#[test]
fn voxduplex_rejects_out_of_range_threshold() {
    let output = voxduplex()
        .args(["--api-key", "test", "--vad-threshold", "1.5"])
        .output()
        .expect("run voxduplex with a bad threshold");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("--vad-threshold"));
}
