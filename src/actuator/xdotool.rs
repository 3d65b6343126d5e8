//! X11 input device backed by the `xdotool` and `xclip` programs.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{DeviceError, DeviceResult, InputDevice, Modifier};
use crate::registry::Address;
use crate::types::ActuatorConfig;

/// Drives the desktop through child processes. Children are killed when an
/// attempt times out and its future is dropped.
#[derive(Debug, Clone)]
pub struct XdotoolDevice {
    xdotool: String,
    clipboard: String,
    type_delay_ms: u64,
}

impl XdotoolDevice {
    pub fn new(config: &ActuatorConfig) -> Self {
        Self {
            xdotool: config.xdotool_program.clone(),
            clipboard: config.clipboard_program.clone(),
            type_delay_ms: config.type_delay_ms,
        }
    }

    async fn xdotool(&self, args: &[&str]) -> DeviceResult<()> {
        let output = Command::new(&self.xdotool)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.xdotool, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DeviceError::Transient(format!(
                "{} {} exited with {}: {}",
                self.xdotool,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Hand `text` to the clipboard program. xclip forks a background owner
    /// that keeps the selection alive and inherits stdio, so only the exit
    /// status of the direct child is awaited and no pipe is left to drain.
    async fn load_clipboard(&self, text: &str) -> DeviceResult<()> {
        let mut child = Command::new(&self.clipboard)
            .args(["-selection", "clipboard"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.clipboard, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| DeviceError::Transient(format!("clipboard write: {}", e)))?;
            // Dropping stdin closes the pipe so the clipboard tool can finish.
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DeviceError::Transient(format!("clipboard wait: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(DeviceError::Transient(format!(
                "{} exited with {}",
                self.clipboard, status
            )))
        }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> DeviceError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DeviceError::Fatal(format!("{} is not installed", program))
    } else {
        DeviceError::Transient(format!("failed to run {}: {}", program, e))
    }
}

#[async_trait]
impl InputDevice for XdotoolDevice {
    async fn focus(&self, address: Address) -> DeviceResult<()> {
        let x = address.x.to_string();
        let y = address.y.to_string();
        self.xdotool(&["mousemove", "--sync", &x, &y, "click", "1"])
            .await
    }

    async fn clear(&self, modifier: Modifier) -> DeviceResult<()> {
        let select_all = format!("{}+a", modifier.key_name());
        self.xdotool(&["key", "--clearmodifiers", &select_all, "BackSpace"])
            .await
    }

    async fn paste(&self, text: &str, modifier: Modifier) -> DeviceResult<()> {
        self.load_clipboard(text).await?;
        let paste = format!("{}+v", modifier.key_name());
        self.xdotool(&["key", "--clearmodifiers", &paste]).await
    }

    async fn type_text(&self, text: &str) -> DeviceResult<()> {
        let delay = self.type_delay_ms.to_string();
        self.xdotool(&["type", "--clearmodifiers", "--delay", &delay, "--", text])
            .await
    }

    async fn submit(&self) -> DeviceResult<()> {
        self.xdotool(&["key", "--clearmodifiers", "Return"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let device = XdotoolDevice::new(&ActuatorConfig {
            xdotool_program: "/nonexistent/xdotool".to_string(),
            ..ActuatorConfig::default()
        });
        let err = device.submit().await.unwrap_err();
        assert!(matches!(err, DeviceError::Fatal(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clipboard_returns_when_owner_forks_into_background() {
        use std::os::unix::fs::PermissionsExt;

        // Behaves like xclip: reads the text, leaves a background owner
        // holding the inherited stdio, exits 0.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-xclip");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\nsleep 5 &\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let device = XdotoolDevice::new(&ActuatorConfig {
            clipboard_program: script.display().to_string(),
            ..ActuatorConfig::default()
        });
        let loaded = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            device.load_clipboard("hello"),
        )
        .await
        .expect("clipboard load blocked on the background owner");
        assert!(loaded.is_ok());
    }

    #[tokio::test]
    async fn test_clipboard_nonzero_exit_is_transient() {
        let device = XdotoolDevice::new(&ActuatorConfig {
            clipboard_program: "false".to_string(),
            ..ActuatorConfig::default()
        });
        let err = device.load_clipboard("hello").await.unwrap_err();
        assert!(matches!(err, DeviceError::Transient(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient() {
        // `false` ignores its arguments and exits 1.
        let device = XdotoolDevice::new(&ActuatorConfig {
            xdotool_program: "false".to_string(),
            ..ActuatorConfig::default()
        });
        let err = device.focus(Address { x: 1, y: 1 }).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transient(_)));
    }
}
