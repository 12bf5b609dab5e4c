//! User-Friendly Error Formatting
//!
//! Turns startup failures into messages an installer can act on, with
//! troubleshooting hints for the common cases.

use std::fmt::Write;

/// Format error for user consumption
///
/// Takes technical error and produces user-friendly message with
/// troubleshooting steps and context.
pub fn format_user_error(error: &anyhow::Error) -> String {
    let mut output = String::new();

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "╔════════════════════════════════════════════════════════════╗"
    )
    .ok();
    writeln!(
        &mut output,
        "║                     ERROR                                  ║"
    )
    .ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();
    writeln!(&mut output).ok();

    let error_msg = format!("{:#}", error);

    if error_msg.contains("bind") || error_msg.contains("address") {
        format_network_error(&mut output, &error_msg);
    } else if error_msg.contains("recordings") || error_msg.contains("storage") {
        format_storage_error(&mut output, &error_msg);
    } else if error_msg.contains("config") {
        format_config_error(&mut output, &error_msg);
    } else {
        format_generic_error(&mut output, &error_msg);
    }

    writeln!(&mut output).ok();
    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Technical Details:").ok();
    writeln!(&mut output).ok();
    writeln!(&mut output, "{:#}", error).ok();
    writeln!(&mut output).ok();

    writeln!(
        &mut output,
        "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    )
    .ok();
    writeln!(&mut output, "Need Help?").ok();
    writeln!(
        &mut output,
        "  - Run with --verbose for detailed logs: vigil-server -vv"
    )
    .ok();
    writeln!(&mut output, "  - Check logs in: /var/log/vigil-server/").ok();
    writeln!(
        &mut output,
        "╚════════════════════════════════════════════════════════════╝"
    )
    .ok();

    output
}

fn format_network_error(output: &mut String, _error: &str) {
    writeln!(output, "Network Listener Error").ok();
    writeln!(output).ok();
    writeln!(output, "Could not open the device/viewer listening socket.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Port already in use").ok();
    writeln!(output, "     → Check: ss -tlnp | grep 8765").ok();
    writeln!(output, "     → Stop the other process or use --port").ok();
    writeln!(output).ok();
    writeln!(output, "  2. Invalid listen address").ok();
    writeln!(output, "     → Use host:port, e.g. 0.0.0.0:8765").ok();
    writeln!(output).ok();
    writeln!(output, "  3. Privileged port without permission").ok();
    writeln!(output, "     → Ports below 1024 need CAP_NET_BIND_SERVICE").ok();
}

fn format_storage_error(output: &mut String, _error: &str) {
    writeln!(output, "Recording Storage Error").ok();
    writeln!(output).ok();
    writeln!(output, "The recordings directory is not usable.").ok();
    writeln!(output).ok();
    writeln!(output, "Common Causes:").ok();
    writeln!(output).ok();
    writeln!(output, "  1. Directory not writable by the service user").ok();
    writeln!(output, "     → Check ownership of [recording] root_dir").ok();
    writeln!(output).ok();
    writeln!(output, "  2. Disk full or read-only filesystem").ok();
    writeln!(output, "     → Check: df -h").ok();
}

fn format_config_error(output: &mut String, _error: &str) {
    writeln!(output, "Configuration Error").ok();
    writeln!(output).ok();
    writeln!(output, "The configuration file is invalid or inconsistent.").ok();
    writeln!(output).ok();
    writeln!(output, "What To Do:").ok();
    writeln!(output).ok();
    writeln!(output, "  → Check the file for TOML syntax errors").ok();
    writeln!(output, "  → Check the value named in the details below").ok();
    writeln!(output, "  → Remove the file to start from built-in defaults").ok();
}

fn format_generic_error(output: &mut String, error: &str) {
    writeln!(output, "Unexpected Error").ok();
    writeln!(output).ok();
    writeln!(output, "{}", error).ok();
}
