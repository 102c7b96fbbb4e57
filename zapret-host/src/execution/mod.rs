//! Strategy process lifecycle
//!
//! Handles:
//! - Launching a general*.bat as a detached foreground process and capturing its PID
//! - Tracking exactly one running strategy in the persisted config
//! - Aggressive stop: every winws.exe on the host, then the tracked PID
//! - Process-table liveness checks

use crate::config::ConfigStore;
use crate::error::{HostError, Result};
use crate::models::RunningInfo;
use crate::settings::{ScriptHost, Settings};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Bound on the launch step only; the strategy itself keeps running
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One independent attempt at killing strategy processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationStep {
    /// `taskkill /IM <image> /T /F`
    TaskkillImage(String),
    /// PowerShell Stop-Process by name, with a second pass for survivors
    PowerShellStopByName(String),
    /// `wmic process where name='<image>' delete`
    WmicDelete(String),
    /// Kill every process-table entry with this image name
    ProcessTableKill(String),
    /// Kill one PID
    StopPid(u32),
    /// Kill a PID and its descendants
    KillTree(u32),
}

impl TerminationStep {
    pub async fn attempt(&self, hidden: bool) -> Result<()> {
        match self {
            TerminationStep::TaskkillImage(image) => {
                run_quiet("taskkill", &["/IM", image.as_str(), "/T", "/F"], hidden).await
            }
            TerminationStep::PowerShellStopByName(image) => {
                let name = image.trim_end_matches(".exe");
                let script = format!(
                    "$procs = Get-Process -Name {name} -ErrorAction SilentlyContinue\n\
                     if ($procs) {{\n\
                         $procs | Stop-Process -Force -ErrorAction SilentlyContinue\n\
                         Start-Sleep -Milliseconds 200\n\
                         $remaining = Get-Process -Name {name} -ErrorAction SilentlyContinue\n\
                         if ($remaining) {{ $remaining | Stop-Process -Force -ErrorAction Stop }}\n\
                     }}"
                );
                run_quiet(
                    "powershell",
                    &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script.as_str()],
                    hidden,
                )
                .await
            }
            TerminationStep::WmicDelete(image) => {
                let filter = format!("name='{}'", image);
                run_quiet("wmic", &["process", "where", filter.as_str(), "delete"], hidden).await
            }
            TerminationStep::ProcessTableKill(image) => {
                let killed = kill_by_image(image);
                debug!(image = %image, killed, "process table sweep");
                Ok(())
            }
            TerminationStep::StopPid(pid) => stop_pid(*pid, hidden).await,
            TerminationStep::KillTree(pid) => kill_process_tree(*pid, hidden).await,
        }
    }
}

pub struct ProcessManager {
    image: String,
    hidden: bool,
    script_host: ScriptHost,
}

impl ProcessManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            image: settings.strategy_image.clone(),
            hidden: settings.hide_processes,
            script_host: settings.script_host,
        }
    }

    /// Stop whatever is tracked, launch `file` and record it as running
    pub async fn run_strategy(&self, store: &ConfigStore, file: &str) -> Result<RunningInfo> {
        self.stop_running(store).await?;

        let current = store
            .current_release_path()?
            .ok_or_else(|| HostError::NotFound("no current release".to_string()))?;
        let full = if Path::new(file).is_absolute() {
            PathBuf::from(file)
        } else {
            current.join(file)
        };
        if !tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Err(HostError::NotFound(format!("strategy file {}", full.display())));
        }

        let pid = self.launch(&full).await?;
        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());

        let running = RunningInfo {
            file: file_name.clone(),
            pid: i64::from(pid),
            started_at: Utc::now(),
        };
        let tracked = running.clone();
        store.update(move |cfg| {
            cfg.running = Some(tracked);
            cfg.last_strategy = file_name;
        })?;

        info!("Strategy {} running with PID {}", running.file, running.pid);
        Ok(running)
    }

    /// Best-effort kill of every strategy process; always clears `running`
    pub async fn stop_running(&self, store: &ConfigStore) -> Result<()> {
        let tracked = store.read(|cfg| cfg.running.as_ref().map(|r| r.pid))?;

        for step in self.termination_plan(tracked) {
            if let Err(e) = step.attempt(self.hidden).await {
                debug!(step = ?step, "termination step failed: {}", e);
            }
        }

        store.update(|cfg| cfg.running = None)?;
        Ok(())
    }

    /// Ordered termination attempts for the strategy image and the tracked PID
    pub fn termination_plan(&self, tracked: Option<i64>) -> Vec<TerminationStep> {
        let mut plan = Vec::new();

        if cfg!(windows) {
            plan.push(TerminationStep::TaskkillImage(self.image.clone()));
            plan.push(TerminationStep::PowerShellStopByName(self.image.clone()));
            plan.push(TerminationStep::WmicDelete(self.image.clone()));
        }
        plan.push(TerminationStep::ProcessTableKill(self.image.clone()));

        if let Some(pid) = tracked.filter(|pid| is_process_alive(*pid)) {
            // tracked PID may be a cmd.exe / powershell.exe parent
            let pid = pid as u32;
            plan.push(TerminationStep::StopPid(pid));
            plan.push(TerminationStep::KillTree(pid));
        }
        plan
    }

    async fn launch(&self, path: &Path) -> Result<u32> {
        let workdir = path.parent().unwrap_or_else(|| Path::new("."));
        let launch = async {
            match self.script_host {
                ScriptHost::PowerShell => self.launch_with_powershell(path, workdir).await,
                ScriptHost::Shell => self.launch_with_shell(path, workdir).await,
            }
        };

        let pid = tokio::time::timeout(LAUNCH_TIMEOUT, launch)
            .await
            .map_err(|_| HostError::Launch(format!("launch of {} timed out", path.display())))??;

        if pid == 0 {
            return Err(HostError::Launch(format!("no PID for {}", path.display())));
        }
        Ok(pid)
    }

    /// `Start-Process -PassThru` prints the PID of the detached console
    async fn launch_with_powershell(&self, path: &Path, workdir: &Path) -> Result<u32> {
        let window_style = if self.hidden { "Hidden" } else { "Normal" };
        let script = format!(
            "$p = Start-Process -FilePath {} -WorkingDirectory {} -WindowStyle {} -PassThru; Write-Output $p.Id",
            ps_quote(&path.to_string_lossy()),
            ps_quote(&workdir.to_string_lossy()),
            window_style
        );

        let mut cmd = AsyncCommand::new("powershell");
        cmd.arg("-NoProfile");
        if self.hidden {
            cmd.args(["-WindowStyle", "Hidden"]);
        }
        cmd.args(["-Command", script.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        apply_console_flags(&mut cmd, self.hidden, false);

        let output = cmd
            .output()
            .await
            .map_err(|e| HostError::Launch(format!("failed to start powershell: {}", e)))?;
        if !output.status.success() {
            return Err(HostError::Launch(format!(
                "Start-Process failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| HostError::Launch(format!("no PID in output: {}", stdout.trim())))
    }

    async fn launch_with_shell(&self, path: &Path, workdir: &Path) -> Result<u32> {
        let mut cmd = AsyncCommand::new("sh");
        cmd.arg(path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        // the child is left running; tokio reaps it once it exits
        let child = cmd
            .spawn()
            .map_err(|e| HostError::Launch(format!("failed to start {}: {}", path.display(), e)))?;
        child
            .id()
            .ok_or_else(|| HostError::Launch(format!("{} exited before reporting a PID", path.display())))
    }
}

/// Query the process table; zombies count as dead
pub fn is_process_alive(pid: i64) -> bool {
    let Ok(pid) = u32::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Kill a process and its descendants. Failures are logged only.
pub async fn kill_process_tree(pid: u32, hidden: bool) -> Result<()> {
    if pid == 0 {
        return Ok(());
    }

    #[cfg(windows)]
    {
        let pid = pid.to_string();
        run_quiet("taskkill", &["/PID", pid.as_str(), "/T", "/F"], hidden).await
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;

        let _ = hidden;
        // launched processes lead their own process group
        killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| HostError::Launch(format!("killpg {}: {}", pid, e)))
    }
}

async fn stop_pid(pid: u32, hidden: bool) -> Result<()> {
    #[cfg(windows)]
    {
        let script = format!("Stop-Process -Id {} -Force -ErrorAction SilentlyContinue", pid);
        run_quiet("powershell", &["-NoProfile", "-Command", script.as_str()], hidden).await
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        let _ = hidden;
        kill(NixPid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| HostError::Launch(format!("kill {}: {}", pid, e)))
    }
}

fn kill_by_image(image: &str) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();

    sys.processes()
        .values()
        .filter(|p| image_matches(p.name(), image))
        .filter(|p| p.kill())
        .count()
}

fn image_matches(process_name: &str, image: &str) -> bool {
    let stem = image.trim_end_matches(".exe");
    process_name.eq_ignore_ascii_case(image) || process_name.eq_ignore_ascii_case(stem)
}

async fn run_quiet(program: &str, args: &[&str], hidden: bool) -> Result<()> {
    let mut cmd = AsyncCommand::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    apply_console_flags(&mut cmd, hidden, false);

    let status = cmd
        .status()
        .await
        .map_err(|e| HostError::Launch(format!("{}: {}", program, e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(HostError::Launch(format!("{} exited with {}", program, status)))
    }
}

/// Windows console creation flags; no-op elsewhere
pub(crate) fn apply_console_flags(cmd: &mut AsyncCommand, hidden: bool, new_console: bool) {
    #[cfg(windows)]
    {
        use winapi::um::winbase::{CREATE_NEW_CONSOLE, CREATE_NO_WINDOW};

        if hidden {
            cmd.creation_flags(CREATE_NO_WINDOW);
        } else if new_console {
            cmd.creation_flags(CREATE_NEW_CONSOLE);
        }
    }

    #[cfg(not(windows))]
    {
        let _ = (cmd, hidden, new_console);
    }
}

/// Single-quoted PowerShell literal
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
