use anyhow::{anyhow, Context, Result};
use log::debug;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{}\n{}", stdout, stderr),
            (false, true) => stdout.to_string(),
            _ => stderr.to_string(),
        }
    }
}

/// Runs `program` to completion, capturing its output. A non-zero exit is an
/// error carrying everything the tool printed.
pub fn run_tool<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_tool_with_input(program, args, None)
}

pub fn run_tool_with_input<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    input: Option<&str>,
) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let args: Vec<OsString> = args
        .into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect();
    let rendered = render_command(program, &args);
    debug!("running {}", rendered);

    let mut command = Command::new(program);
    command
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    let mut child = command
        .spawn()
        .with_context(|| format!("run {}", program.to_string_lossy()))?;
    if let Some(input) = input {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin of {} unavailable", rendered))?;
        stdin
            .write_all(input.as_bytes())
            .with_context(|| format!("write input to {}", rendered))?;
    }
    let output = child
        .wait_with_output()
        .with_context(|| format!("wait for {}", rendered))?;

    let captured = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    if output.status.success() {
        Ok(captured)
    } else {
        Err(anyhow!(
            "{} failed ({}): {}",
            rendered,
            output.status,
            captured.combined()
        ))
    }
}

/// Flattens an anyhow chain into the `output` field of a host error.
pub fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    })
}

fn render_command(program: &OsStr, args: &[OsString]) -> String {
    let mut rendered = program.to_string_lossy().to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
