use voxduplex::audio::{list_input_devices, InputDeviceInfo};

/// `VOXDUPLEX_TEST_DEVICES` (comma separated names) replaces the real device
/// scan so the listing can be exercised without audio hardware.
fn detected_devices() -> Vec<InputDeviceInfo> {
    if let Ok(raw) = std::env::var("VOXDUPLEX_TEST_DEVICES") {
        return raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .enumerate()
            .map(|(index, name)| InputDeviceInfo {
                index,
                name: name.to_string(),
                channels: 1,
            })
            .collect();
    }
    list_input_devices().unwrap_or_else(|err| {
        eprintln!("Failed to list audio input devices: {err:#}");
        Vec::new()
    })
}

pub(crate) fn format_device(device: &InputDeviceInfo) -> String {
    let plural = if device.channels == 1 { "" } else { "s" };
    format!(
        "  [{}] {} ({} channel{plural})",
        device.index, device.name, device.channels
    )
}

pub(crate) fn print_input_devices() {
    let devices = detected_devices();
    if devices.is_empty() {
        println!("No audio input devices detected.");
        return;
    }
    println!("Available audio input devices:");
    for device in &devices {
        println!("{}", format_device(device));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_device_shows_index_and_channels() {
        let mono = InputDeviceInfo {
            index: 0,
            name: "USB Mic".into(),
            channels: 1,
        };
        assert_eq!(format_device(&mono), "  [0] USB Mic (1 channel)");
        let stereo = InputDeviceInfo {
            index: 3,
            name: "Built-in".into(),
            channels: 2,
        };
        assert_eq!(format_device(&stereo), "  [3] Built-in (2 channels)");
    }
}
