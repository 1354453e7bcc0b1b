//! Command-backed collaborators.
//!
//! Each adapter renders an argv template from `[platform]` in `warden.toml`
//! and runs it. Output parsing is kept in free functions so it can be tested
//! without spawning anything.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use warden_core::alert::{EvidenceUploader, LocationProvider, SmsTransport, UploadReceipt};
use warden_core::{LaunchFlag, SurfaceLauncher, SurfaceRequest};

const FLAGS_PLACEHOLDER: &str = "{flags}";

pub trait CommandRunner: Send + Sync {
    /// Runs `argv` and returns its stdout.
    fn run(&self, argv: &[String]) -> Result<String, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String]) -> Result<String, String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty command".to_string())?;
        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(output) => Err(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(err) => Err(format!("failed to run {}: {}", program, err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn is_configured(&self) -> bool {
        !self.argv.is_empty()
    }

    /// Substitutes `{key}` placeholders. An argument that is exactly `{flags}`
    /// becomes one argument per launch flag.
    pub fn render(&self, values: &[(&str, &str)], flags: &[LaunchFlag]) -> Vec<String> {
        let mut rendered = Vec::with_capacity(self.argv.len() + flags.len());
        for arg in &self.argv {
            if arg == FLAGS_PLACEHOLDER {
                rendered.extend(flags.iter().map(|flag| flag.am_switch().to_string()));
                continue;
            }
            let mut value = arg.clone();
            for (key, replacement) in values {
                value = value.replace(&format!("{{{}}}", key), replacement);
            }
            rendered.push(value);
        }
        rendered
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Surface launching
// ─────────────────────────────────────────────────────────────────────────────

pub struct CommandSurfaceLauncher {
    lock: CommandTemplate,
    entry: CommandTemplate,
    runner: Arc<dyn CommandRunner>,
}

impl CommandSurfaceLauncher {
    pub fn new(lock: CommandTemplate, entry: CommandTemplate, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            lock,
            entry,
            runner,
        }
    }
}

impl SurfaceLauncher for CommandSurfaceLauncher {
    fn launch(&self, request: &SurfaceRequest) -> Result<(), String> {
        let argv = match request {
            SurfaceRequest::Lock {
                challenge_id,
                package,
                display_name,
            } => {
                if !self.lock.is_configured() {
                    return Err("lock surface command not configured".to_string());
                }
                let challenge = challenge_id.to_string();
                self.lock.render(
                    &[
                        ("package", package.as_str()),
                        ("name", display_name.as_str()),
                        ("challenge", challenge.as_str()),
                    ],
                    request.flags(),
                )
            }
            SurfaceRequest::Entry => {
                if !self.entry.is_configured() {
                    return Err("entry surface command not configured".to_string());
                }
                self.entry.render(&[], request.flags())
            }
        };
        debug!(program = ?argv.first(), "Launching surface");
        self.runner.run(&argv).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SMS
// ─────────────────────────────────────────────────────────────────────────────

pub struct CommandSmsTransport {
    template: CommandTemplate,
    runner: Arc<dyn CommandRunner>,
}

impl CommandSmsTransport {
    pub fn new(template: CommandTemplate, runner: Arc<dyn CommandRunner>) -> Self {
        Self { template, runner }
    }
}

impl SmsTransport for CommandSmsTransport {
    /// One invocation per part, in order; the first failure stops the rest.
    fn send(&self, to: &str, parts: &[String]) -> Result<(), String> {
        if !self.template.is_configured() {
            return Err("sms command not configured".to_string());
        }
        for part in parts {
            let argv = self.template.render(&[("to", to), ("body", part.as_str())], &[]);
            self.runner.run(&argv)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Location
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LocationFix {
    latitude: f64,
    longitude: f64,
}

pub fn map_link_from_fix(output: &str) -> Result<String, String> {
    let fix: LocationFix = serde_json::from_str(output.trim())
        .map_err(|err| format!("location output is not a fix: {}", err))?;
    if !fix.latitude.is_finite() || !fix.longitude.is_finite() {
        return Err("location fix is not finite".to_string());
    }
    Ok(format!(
        "https://maps.google.com/?q={},{}",
        fix.latitude, fix.longitude
    ))
}

pub struct CommandLocationProvider {
    template: CommandTemplate,
    runner: Arc<dyn CommandRunner>,
}

impl CommandLocationProvider {
    pub fn new(template: CommandTemplate, runner: Arc<dyn CommandRunner>) -> Self {
        Self { template, runner }
    }
}

impl LocationProvider for CommandLocationProvider {
    fn locate(&self) -> Result<String, String> {
        if !self.template.is_configured() {
            return Err("location command not configured".to_string());
        }
        let output = self.runner.run(&self.template.render(&[], &[]))?;
        map_link_from_fix(&output)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadOutput {
    link: String,
    #[serde(default)]
    folder_id: Option<String>,
}

/// Accepts either a bare link or `{"link": .., "folder_id": ..}`.
pub fn parse_upload_output(output: &str) -> Result<UploadReceipt, String> {
    let trimmed = output.trim();
    if trimmed.starts_with('{') {
        let parsed: UploadOutput = serde_json::from_str(trimmed)
            .map_err(|err| format!("upload output is invalid JSON: {}", err))?;
        if parsed.link.trim().is_empty() {
            return Err("upload returned an empty link".to_string());
        }
        return Ok(UploadReceipt {
            link: parsed.link.trim().to_string(),
            folder_id: parsed
                .folder_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        });
    }

    let link = trimmed.lines().next().map(str::trim).unwrap_or_default();
    if link.is_empty() {
        return Err("upload returned no link".to_string());
    }
    Ok(UploadReceipt {
        link: link.to_string(),
        folder_id: None,
    })
}

pub struct CommandUploader {
    template: CommandTemplate,
    runner: Arc<dyn CommandRunner>,
}

impl CommandUploader {
    pub fn new(template: CommandTemplate, runner: Arc<dyn CommandRunner>) -> Self {
        Self { template, runner }
    }
}

impl EvidenceUploader for CommandUploader {
    fn upload(&self, path: &Path, folder_id: Option<&str>) -> Result<UploadReceipt, String> {
        if !self.template.is_configured() {
            return Err("upload command not configured".to_string());
        }
        let path = path.to_string_lossy().into_owned();
        let argv = self.template.render(
            &[("path", path.as_str()), ("folder", folder_id.unwrap_or(""))],
            &[],
        );
        let output = self.runner.run(&argv)?;
        parse_upload_output(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRunner {
        outputs: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRunner {
        fn with_outputs(outputs: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, argv: &[String]) -> Result<String, String> {
            self.calls.lock().unwrap().push(argv.to_vec());
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn template(parts: &[&str]) -> CommandTemplate {
        CommandTemplate::new(parts.iter().map(|part| part.to_string()).collect())
    }

    #[test]
    fn render_expands_flags_in_place() {
        let rendered = template(&["am", "start", "{flags}", "-n", "pkg/.Main"])
            .render(&[], &[LaunchFlag::NewTask, LaunchFlag::ClearTask]);
        assert_eq!(
            rendered,
            vec![
                "am",
                "start",
                "--activity-new-task",
                "--activity-clear-task",
                "-n",
                "pkg/.Main"
            ]
        );
    }

    #[test]
    fn render_substitutes_embedded_placeholders() {
        let rendered = template(&["send", "--to={to}", "{body}"])
            .render(&[("to", "+919876543210"), ("body", "hello {to}")], &[]);
        assert_eq!(rendered, vec!["send", "--to=+919876543210", "hello {to}"]);
    }

    #[test]
    fn lock_launch_passes_challenge_details() {
        let runner = FakeRunner::with_outputs(vec![]);
        let launcher = CommandSurfaceLauncher::new(
            template(&["launch", "{flags}", "{package}", "{name}", "{challenge}"]),
            template(&["entry"]),
            runner.clone(),
        );

        launcher
            .launch(&SurfaceRequest::Lock {
                challenge_id: 42,
                package: "com.bank.app".to_string(),
                display_name: "Bank".to_string(),
            })
            .expect("launch");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "launch");
        assert!(calls[0].contains(&"--activity-single-top".to_string()));
        assert!(calls[0].contains(&"--activity-no-user-action".to_string()));
        assert_eq!(&calls[0][calls[0].len() - 3..], ["com.bank.app", "Bank", "42"]);
    }

    #[test]
    fn unconfigured_templates_report_disabled() {
        let runner = FakeRunner::with_outputs(vec![]);
        let launcher =
            CommandSurfaceLauncher::new(template(&[]), template(&[]), runner.clone());
        assert!(launcher.launch(&SurfaceRequest::Entry).is_err());

        let sms = CommandSmsTransport::new(template(&[]), runner.clone());
        assert!(sms.send("+1", &["body".to_string()]).is_err());

        let uploader = CommandUploader::new(template(&[]), runner.clone());
        assert!(uploader.upload(Path::new("/tmp/x.jpg"), None).is_err());

        assert!(runner.calls().is_empty());
    }

    #[test]
    fn sms_sends_each_part_and_stops_on_failure() {
        let runner = FakeRunner::with_outputs(vec![
            Ok(String::new()),
            Err("radio off".to_string()),
            Ok(String::new()),
        ]);
        let sms = CommandSmsTransport::new(template(&["sms", "{to}", "{body}"]), runner.clone());
        let parts = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let err = sms.send("+919876543210", &parts).expect_err("second part fails");
        assert_eq!(err, "radio off");
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["sms", "+919876543210", "one"]);
    }

    #[test]
    fn location_fix_becomes_map_link() {
        let link = map_link_from_fix(
            r#"{"latitude": 12.9716, "longitude": 77.5946, "accuracy": 20.0, "provider": "network"}"#,
        )
        .expect("fix");
        assert_eq!(link, "https://maps.google.com/?q=12.9716,77.5946");
        assert!(map_link_from_fix("").is_err());
        assert!(map_link_from_fix(r#"{"error": "no fix"}"#).is_err());
    }

    #[test]
    fn location_provider_propagates_runner_failure() {
        let runner = FakeRunner::with_outputs(vec![Err("gps off".to_string())]);
        let provider = CommandLocationProvider::new(template(&["locate"]), runner);
        assert_eq!(provider.locate(), Err("gps off".to_string()));
    }

    #[test]
    fn upload_output_accepts_link_or_json() {
        let bare = parse_upload_output("https://drive.example/file/1\n").expect("bare link");
        assert_eq!(bare.link, "https://drive.example/file/1");
        assert!(bare.folder_id.is_none());

        let json = parse_upload_output(r#"{"link": "https://drive.example/file/2", "folder_id": "F1"}"#)
            .expect("json");
        assert_eq!(json.folder_id.as_deref(), Some("F1"));

        assert!(parse_upload_output("   ").is_err());
        assert!(parse_upload_output(r#"{"link": ""}"#).is_err());
    }

    #[test]
    fn uploader_passes_path_and_cached_folder() {
        let runner = FakeRunner::with_outputs(vec![Ok("https://drive.example/f\n".to_string())]);
        let uploader = CommandUploader::new(
            template(&["upload", "{path}", "--parent={folder}"]),
            runner.clone(),
        );

        let receipt = uploader
            .upload(Path::new("/data/intruders/Intrusion-1.jpg"), Some("F9"))
            .expect("upload");
        assert_eq!(receipt.link, "https://drive.example/f");
        assert_eq!(
            runner.calls()[0],
            vec!["upload", "/data/intruders/Intrusion-1.jpg", "--parent=F9"]
        );
    }
}
