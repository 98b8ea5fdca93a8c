//! Android driver speaking the `adb` command-line protocol.
//!
//! Every call is a short-lived `adb` subprocess bounded by a timeout, so a
//! wedged device never blocks the loop past its budget.

use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::normalize::Dialect;
use crate::core::types::{Key, ScreenSize};
use crate::io::config::DeviceConfig;
use crate::io::driver::{DeviceDriver, DriverError, PrimitiveAction, RawDispatch, RawSnapshot};
use crate::io::process::{CommandOutput, run_command_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024;
const HIERARCHY_END: &str = "</hierarchy>";

static FOCUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mCurrentFocus=Window\{[^}]*?\s([A-Za-z0-9_.]+)/[^\s}]+\}").unwrap()
});
static FOCUSED_APP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mFocusedApp=.*?\s([A-Za-z0-9_.]+)/[^\s}]+").unwrap()
});
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(Physical|Override) size:\s*(\d+)x(\d+)").unwrap());

/// Attached device as reported by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    pub state: String,
}

impl AdbDevice {
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

/// `adb`-backed [`DeviceDriver`].
#[derive(Debug, Clone)]
pub struct AdbDriver {
    adb_path: String,
    serial: String,
    capture_screenshots: bool,
}

impl AdbDriver {
    pub fn new(adb_path: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial: serial.into(),
            capture_screenshots: true,
        }
    }

    pub fn with_screenshots(mut self, enabled: bool) -> Self {
        self.capture_screenshots = enabled;
        self
    }

    /// Resolve the target device from config, restarting the adb server when none is visible.
    #[instrument(skip_all, fields(adb = %cfg.adb_path))]
    pub fn connect(cfg: &DeviceConfig) -> Result<Self> {
        let attempts = cfg.server_restart_attempts.max(1);
        for attempt in 1..=attempts {
            let devices = list_devices(&cfg.adb_path)?;
            let ready: Vec<&AdbDevice> = devices.iter().filter(|d| d.is_ready()).collect();
            let chosen = match &cfg.serial {
                Some(serial) => ready.iter().find(|d| &d.serial == serial).copied(),
                None => ready.first().copied(),
            };
            if let Some(device) = chosen {
                info!(serial = %device.serial, "using device");
                return Ok(Self::new(cfg.adb_path.clone(), device.serial.clone())
                    .with_screenshots(cfg.capture_screenshots));
            }
            if attempt < attempts {
                warn!(attempt, attempts, "no ready device, restarting adb server");
                restart_server(&cfg.adb_path)?;
                thread::sleep(Duration::from_secs(3));
            }
        }
        match &cfg.serial {
            Some(serial) => Err(anyhow!("device {serial} not found or not ready")),
            None => Err(anyhow!("no ready device found")),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        cmd.arg("-s").arg(&self.serial).args(args);
        cmd
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, DriverError> {
        debug!(?args, "adb");
        let output = run_command_with_timeout(self.command(args), None, timeout, OUTPUT_LIMIT_BYTES)
            .map_err(|err| DriverError::unavailable(format!("{err:#}")))?;
        if output.timed_out {
            return Err(DriverError::Timeout(timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(classify_failure(stderr.trim(), output.status.code()));
        }
        Ok(output)
    }

    fn shell(&self, args: &[&str], timeout: Duration) -> Result<String, DriverError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.run(&full, timeout)?;
        let stdout = output.stdout_lossy();
        // `adb shell` exits 0 even when the device-side command reports an error.
        if let Some(line) = stdout
            .lines()
            .chain(output.stderr_lossy().lines())
            .find(|l| {
                l.starts_with("Error") || l.starts_with("Exception") || l.starts_with("java.lang.")
            })
        {
            return Err(DriverError::refused(line.trim().to_string()));
        }
        Ok(stdout)
    }

    fn focused_app(&self, timeout: Duration) -> Option<String> {
        match self.shell(&["dumpsys", "window"], timeout) {
            Ok(out) => parse_focused_app(&out),
            Err(err) => {
                warn!(err = %err, "focused app lookup failed");
                None
            }
        }
    }

    fn screen_size(&self, timeout: Duration) -> Option<ScreenSize> {
        self.shell(&["wm", "size"], timeout)
            .ok()
            .and_then(|out| parse_screen_size(&out))
    }
}

impl DeviceDriver for AdbDriver {
    #[instrument(skip_all, fields(serial = %self.serial))]
    fn capture(&self, timeout: Duration) -> Result<RawSnapshot, DriverError> {
        let deadline = Instant::now() + timeout;
        let remaining = || {
            deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(DriverError::Timeout(timeout))
        };

        let dump = self.run(&["exec-out", "uiautomator", "dump", "/dev/tty"], remaining()?)?;
        let payload = extract_hierarchy(&dump.stdout_lossy())
            .ok_or_else(|| DriverError::unavailable("uiautomator dump returned no hierarchy"))?;

        let screenshot_png = if self.capture_screenshots {
            match self.run(&["exec-out", "screencap", "-p"], remaining()?) {
                Ok(out) if !out.stdout.is_empty() => Some(out.stdout),
                Ok(_) => None,
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    warn!(err = %err, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };

        let focused_app = self.focused_app(remaining()?);
        let screen = self.screen_size(remaining()?);
        debug!(
            payload_bytes = payload.len(),
            screenshot = screenshot_png.is_some(),
            "captured"
        );
        Ok(RawSnapshot {
            dialect: Dialect::UiautomatorXml,
            payload,
            screenshot_png,
            focused_app,
            screen,
        })
    }

    #[instrument(skip_all, fields(serial = %self.serial))]
    fn dispatch(
        &self,
        action: &PrimitiveAction,
        timeout: Duration,
    ) -> Result<RawDispatch, DriverError> {
        let output = match action {
            PrimitiveAction::Tap { at } => {
                self.shell(&["input", "tap", &at.x.to_string(), &at.y.to_string()], timeout)?
            }
            PrimitiveAction::LongPress { at, duration_ms } => {
                let (x, y) = (at.x.to_string(), at.y.to_string());
                self.shell(
                    &["input", "swipe", &x, &y, &x, &y, &duration_ms.to_string()],
                    timeout,
                )?
            }
            PrimitiveAction::Swipe {
                from,
                to,
                duration_ms,
            } => self.shell(
                &[
                    "input",
                    "swipe",
                    &from.x.to_string(),
                    &from.y.to_string(),
                    &to.x.to_string(),
                    &to.y.to_string(),
                    &duration_ms.to_string(),
                ],
                timeout,
            )?,
            PrimitiveAction::InputText { text } => {
                self.shell(&["input", "text", &escape_input_text(text)], timeout)?
            }
            PrimitiveAction::Key { key } => {
                self.shell(&["input", "keyevent", keycode(*key)], timeout)?
            }
            PrimitiveAction::LaunchApp { package } => {
                let out = self.shell(
                    &[
                        "monkey",
                        "-p",
                        package,
                        "-c",
                        "android.intent.category.LAUNCHER",
                        "1",
                    ],
                    timeout,
                )?;
                if out.contains("No activities found") {
                    return Err(DriverError::refused(format!("no launchable activity in {package}")));
                }
                out
            }
            PrimitiveAction::Wait { duration_ms } => {
                thread::sleep(Duration::from_millis(*duration_ms).min(timeout));
                String::new()
            }
        };
        Ok(RawDispatch { output })
    }
}

/// List devices known to the adb server.
#[instrument(skip_all)]
pub fn list_devices(adb_path: &str) -> Result<Vec<AdbDevice>> {
    let mut cmd = Command::new(adb_path);
    cmd.arg("devices");
    let output = run_command_with_timeout(cmd, None, Duration::from_secs(15), 64 * 1024)
        .with_context(|| format!("run {adb_path} devices"))?;
    if output.timed_out || !output.status.success() {
        return Err(anyhow!(
            "{adb_path} devices failed: {}",
            output.stderr_lossy().trim()
        ));
    }
    Ok(parse_devices(&output.stdout_lossy()))
}

fn restart_server(adb_path: &str) -> Result<()> {
    for sub in ["kill-server", "start-server"] {
        let mut cmd = Command::new(adb_path);
        cmd.arg(sub);
        run_command_with_timeout(cmd, None, Duration::from_secs(20), 64 * 1024)
            .with_context(|| format!("run {adb_path} {sub}"))?;
    }
    Ok(())
}

fn classify_failure(stderr: &str, code: Option<i32>) -> DriverError {
    let lowered = stderr.to_lowercase();
    let transport = ["offline", "not found", "no devices", "unauthorized", "closed", "cannot connect"];
    if transport.iter().any(|needle| lowered.contains(needle)) {
        return DriverError::unavailable(stderr.to_string());
    }
    DriverError::refused(format!("adb exited with {code:?}: {stderr}"))
}

fn parse_devices(out: &str) -> Vec<AdbDevice> {
    out.lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(AdbDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

fn extract_hierarchy(out: &str) -> Option<String> {
    let start = out.find("<?xml").or_else(|| out.find("<hierarchy"))?;
    let body = &out[start..];
    let end = body.find(HIERARCHY_END).map_or(body.len(), |i| i + HIERARCHY_END.len());
    Some(body[..end].to_string())
}

fn parse_focused_app(dumpsys: &str) -> Option<String> {
    FOCUS_RE
        .captures(dumpsys)
        .or_else(|| FOCUSED_APP_RE.captures(dumpsys))
        .map(|caps| caps[1].to_string())
}

fn parse_screen_size(out: &str) -> Option<ScreenSize> {
    let mut size = None;
    for caps in SIZE_RE.captures_iter(out) {
        let parsed = ScreenSize {
            width: caps[2].parse().ok()?,
            height: caps[3].parse().ok()?,
        };
        // Override size wins over physical size.
        if size.is_none() || &caps[1] == "Override" {
            size = Some(parsed);
        }
    }
    size
}

fn keycode(key: Key) -> &'static str {
    match key {
        Key::Back => "KEYCODE_BACK",
        Key::Home => "KEYCODE_HOME",
        Key::Enter => "KEYCODE_ENTER",
        Key::Delete => "KEYCODE_DEL",
        Key::AppSwitch => "KEYCODE_APP_SWITCH",
    }
}

/// Escape text for `input text`, which runs through the device shell.
///
/// Spaces become `%s`, so a literal `%` is escaped to keep `50%sale` intact.
fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '\\' | '%' | '"' | '\'' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*'
            | '?' | '~' | '#' | '!' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_list() {
        let out = "* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\nR58M123\tunauthorized\n\n";
        let devices = parse_devices(out);
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_ready());
        assert_eq!(devices[1].state, "unauthorized");
    }

    #[test]
    fn extracts_hierarchy_from_exec_out() {
        let out = "<?xml version='1.0' ?><hierarchy rotation=\"0\"><node /></hierarchy>UI hierchary dumped to: /dev/tty";
        let xml = extract_hierarchy(out).expect("hierarchy");
        assert!(xml.ends_with("</hierarchy>"));
        assert!(extract_hierarchy("ERROR: null root node returned").is_none());
    }

    #[test]
    fn parses_focus_and_size() {
        let dumpsys = "  mCurrentFocus=Window{5e1c2d u0 com.android.settings/com.android.settings.Settings}\n";
        assert_eq!(
            parse_focused_app(dumpsys).as_deref(),
            Some("com.android.settings")
        );
        let size = parse_screen_size("Physical size: 1080x2400\nOverride size: 720x1600\n");
        assert_eq!(
            size,
            Some(ScreenSize {
                width: 720,
                height: 1600
            })
        );
    }

    #[test]
    fn escapes_shell_sensitive_text() {
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b'c"), "a\\&b\\'c");
        assert_eq!(escape_input_text("50% off"), "50\\%%soff");
    }

    #[test]
    fn offline_device_is_transient() {
        assert!(classify_failure("error: device offline", Some(1)).is_transient());
        assert!(!classify_failure("input: unknown command", Some(1)).is_transient());
    }
}
