use crate::config::{Config, StartupConfig};
use crate::error::GateError;
use crate::session::{ProcessHandle, RegistryBuilder, Session, SessionRegistry};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Number of random bytes in a session token
pub const TOKEN_BYTES: usize = 32;

/// How long to wait for a killed backend to be reaped before running its stop script
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Generate a per-session token: 32 bytes from the OS random source, base64 encoded
pub fn generate_token() -> Result<String, GateError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| GateError::Randomness(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// `/proxy/<shared_token>/<user>/`, unescaped.
///
/// Backends get this as their base URL and the entry redirect sends clients
/// to it, so both must build it here.
pub fn base_url(shared_token: &str, user: &str) -> String {
    format!("/proxy/{}/{}/", shared_token, user)
}

/// Starts, tracks and stops one backend per user through the setup, start
/// and stop scripts.
///
/// Startup is sequential: [`start_all`](ProcessSupervisor::start_all) runs
/// the setup script for a user to completion, launches the start script on
/// its own task, registers the session once the process handle has been
/// handed back, and only then moves on to the next user. The port of the
/// n-th user is therefore always `base_port + n`.
pub struct ProcessSupervisor {
    shared_token: String,
    env_dir: PathBuf,
    setup_script: PathBuf,
    start_script: PathBuf,
    stop_script: Option<PathBuf>,
    base_port: u16,
    startup: StartupConfig,
}

impl ProcessSupervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            shared_token: config.token.clone(),
            env_dir: config.env_dir.clone(),
            setup_script: config.setup_script.clone(),
            start_script: config.start_script.clone(),
            stop_script: config.stop_script.clone(),
            base_port: config.base_port,
            startup: config.startup.clone(),
        }
    }

    /// Path prefix the backend for `user` is served under
    pub fn base_url(&self, user: &str) -> String {
        base_url(&self.shared_token, user)
    }

    /// Provision and start every user in order, then freeze the registry.
    ///
    /// A provisioning failure aborts the sequence; sessions started before it
    /// keep running.
    pub async fn start_all(&self, users: &[String]) -> Result<SessionRegistry, GateError> {
        let mut builder = RegistryBuilder::new();
        for user in users {
            info!(user = %user, "Setup and start");
            self.provision_and_start(&mut builder, user).await?;
        }
        info!(sessions = builder.len(), "All sessions registered");
        Ok(builder.freeze())
    }

    /// Create the session for one user and add it to `builder`
    pub async fn provision_and_start(
        &self,
        builder: &mut RegistryBuilder,
        user: &str,
    ) -> Result<(), GateError> {
        let token = generate_token()?;

        let port = u16::try_from(self.base_port as usize + builder.len()).map_err(|_| {
            GateError::Configuration(format!("no port left for user '{}'", user))
        })?;

        self.run_setup(user).await?;

        let handle = match self.launch_start(user, port, &token).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(user, error = %e, "Start script handed back no process handle");
                ProcessHandle::inert()
            }
        };

        if self.startup.wait_for_ready {
            let ready = wait_for_port(
                port,
                self.startup.ready_timeout(),
                self.startup.ready_check_interval(),
            )
            .await;
            if ready {
                info!(user, port, "Backend is accepting connections");
            } else {
                warn!(
                    user,
                    port,
                    timeout_secs = self.startup.ready_timeout_secs,
                    "Backend not accepting connections yet, registering anyway"
                );
            }
        }

        builder.insert(Session::new(user, port, token, handle))?;
        debug!(user, port, "Session registered");
        Ok(())
    }

    /// Run the setup script to completion
    async fn run_setup(&self, user: &str) -> Result<(), GateError> {
        let env_dir = self.env_dir.to_string_lossy().into_owned();
        run_script(&self.setup_script, &[user, env_dir.as_str()], user)
            .await
            .map_err(|reason| GateError::Provisioning {
                user: user.to_string(),
                reason,
            })
    }

    /// Launch the start script on its own task and wait only for the handle.
    ///
    /// The task spawns the child, sends the handle back, and then owns the
    /// child until it exits or is killed through the handle.
    async fn launch_start(
        &self,
        user: &str,
        port: u16,
        token: &str,
    ) -> Result<ProcessHandle, GateError> {
        let base_url = self.base_url(user);

        let mut cmd = Command::new(&self.start_script);
        cmd.arg(user)
            .arg(&self.env_dir)
            .arg(&base_url)
            .arg(token)
            .arg(port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!(user, port, "Starting backend");

        let (handle_tx, handle_rx) = oneshot::channel();
        let user_owned = user.to_string();

        tokio::spawn(async move {
            let user = user_owned;

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(user = %user, error = %e, "Failed to launch start script");
                    let _ = handle_tx.send(ProcessHandle::inert());
                    return;
                }
            };

            let pid = child.id();
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_output(stdout, user.clone(), "stdout"));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_output(stderr, user.clone(), "stderr"));
            }

            let (handle, mut control) = ProcessHandle::new(pid);
            if handle_tx.send(handle).is_err() {
                warn!(user = %user, "Supervisor went away before taking the process handle");
            }
            info!(user = %user, pid, "Backend process spawned");

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        info!(user = %user, ?status, "Backend process exited");
                    }
                    Ok(status) => {
                        error!(user = %user, ?status, "Backend process failed");
                    }
                    Err(e) => {
                        error!(user = %user, error = %e, "Error waiting for backend process");
                    }
                },
                Ok(()) = &mut control.kill_rx => {
                    info!(user = %user, pid, "Killing backend process");
                    if let Err(e) = child.kill().await {
                        warn!(user = %user, error = %e, "Failed to kill backend process");
                    }
                }
            }

            control.mark_exited();
        });

        handle_rx.await.map_err(|_| GateError::Launch {
            user: user.to_string(),
            reason: "launch task ended without a process handle".to_string(),
        })
    }

    /// Run the stop script for one session
    async fn run_stop(&self, user: &str, port: u16) -> Result<(), GateError> {
        let Some(ref stop_script) = self.stop_script else {
            warn!(user, "No stop script configured, skipping cleanup");
            return Ok(());
        };

        let env_dir = self.env_dir.to_string_lossy().into_owned();
        let port = port.to_string();
        run_script(stop_script, &[user, env_dir.as_str(), port.as_str()], user)
            .await
            .map_err(|reason| GateError::Shutdown {
                user: user.to_string(),
                reason,
            })
    }

    /// Kill every backend and run its stop script.
    ///
    /// Sessions are handled in registration order. A failing stop script is
    /// logged and does not stop the loop; the failures are returned.
    pub async fn terminate_all(&self, registry: &SessionRegistry) -> Vec<GateError> {
        let mut failures = Vec::new();

        for session in registry.iter() {
            info!(user = %session.user, port = session.port, "Shutting down session");

            if session.process.terminate()
                && tokio::time::timeout(KILL_WAIT, session.process.wait_exited())
                    .await
                    .is_err()
            {
                warn!(user = %session.user, "Backend did not exit after kill");
            }

            if let Err(e) = self.run_stop(&session.user, session.port).await {
                error!(user = %session.user, error = %e, "Stop script failed");
                failures.push(e);
            }
        }

        failures
    }
}

/// Run a script to completion, logging what it printed.
/// A non-zero exit or a launch failure becomes the error string.
async fn run_script(path: &Path, args: &[&str], user: &str) -> Result<(), String> {
    debug!(user, script = %path.display(), "Running script");

    let output: Output = Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", path.display(), e))?;

    log_output(user, path, &output);

    if output.status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}", path.display(), output.status))
    }
}

fn log_output(user: &str, path: &Path, output: &Output) {
    let script = path.display().to_string();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!(user, script = %script, stream = "stdout", "{}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        info!(user, script = %script, stream = "stderr", "{}", line);
    }
}

/// Forward a child's output to the log, one line at a time
async fn forward_output<R>(stream: R, user: String, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(user = %user, stream = name, "{}", line);
    }
}

/// Poll until something accepts TCP connections on `localhost:port`
pub async fn wait_for_port(port: u16, timeout: Duration, interval: Duration) -> bool {
    let start = Instant::now();
    loop {
        let attempt = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect(("localhost", port)),
        )
        .await;

        if let Ok(Ok(_)) = attempt {
            return true;
        }

        if start.elapsed() >= timeout {
            return false;
        }

        tokio::time::sleep(interval).await;
    }
}
