use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use execute::Execute;
use log::{debug, info, warn};
use tokio::{net::TcpStream, time};

use crate::error::{Error, Result};

/// Where and as whom to run remote commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub user: String,
    pub address: String,
    pub key_file: PathBuf,
}

impl Host {
    pub fn new<U: Into<String>, A: Into<String>, K: Into<PathBuf>>(
        user: U,
        address: A,
        key_file: K,
    ) -> Self {
        Host {
            user: user.into(),
            address: address.into(),
            key_file: key_file.into(),
        }
    }

    pub fn home(&self) -> String {
        if self.user == "root" {
            "/root".into()
        } else {
            format!("/home/{}", self.user)
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Remote execution. Paths on the remote side are plain strings since they are
/// interpreted by the remote shell.
pub trait Remote: Send + Sync {
    fn run(&self, host: &Host, command: &str) -> Result<CommandOutput>;
    fn upload(&self, host: &Host, local: &Path, remote: &str) -> Result<()>;
    fn write(&self, host: &Host, remote: &str, contents: &[u8]) -> Result<()>;
    fn read(&self, host: &Host, remote: &str) -> Result<Vec<u8>>;

    /// The TCP port to wait on before trying commands, if the transport has one.
    fn port(&self) -> Option<u16> {
        None
    }
}

/// Run `command` and fail unless its exit code is one of `ok_codes`.
pub fn run_checked<R: Remote + ?Sized>(
    remote: &R,
    host: &Host,
    command: &str,
    ok_codes: &[i32],
) -> Result<CommandOutput> {
    let output = remote.run(host, command)?;
    match output.code {
        Some(code) if ok_codes.contains(&code) => Ok(output),
        code => Err(Error::Command {
            command: command.to_string(),
            code,
            stderr: output.stderr,
        }),
    }
}

pub fn run_ok<R: Remote + ?Sized>(remote: &R, host: &Host, command: &str) -> Result<CommandOutput> {
    run_checked(remote, host, command, &[0])
}

/// Cloud-init can bring sshd up before the key is installed, so keep trying
/// `whoami` until it works.
pub async fn wait_for_ssh<R: Remote + ?Sized>(
    remote: &R,
    host: &Host,
    attempts: usize,
    interval: Duration,
) -> Result<()> {
    info!("waiting for {} to become accessible via ssh", host);
    if let Some(port) = remote.port() {
        wait_for_port(&host.address, port, interval, attempts).await?;
    }
    for attempt in 1..=attempts {
        match remote.run(host, "whoami") {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => debug!(
                "attempt {}/{}: whoami on {} exited with {:?}",
                attempt, attempts, host, output.code
            ),
            Err(e) => debug!("attempt {}/{}: {}", attempt, attempts, e),
        }
        if attempt < attempts {
            time::sleep(interval).await;
        }
    }
    Err(Error::ExhaustedAttempts(attempts))
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until something accepts connections on `address:port`.
pub async fn wait_for_port(
    address: &str,
    port: u16,
    interval: Duration,
    attempts: usize,
) -> Result<()> {
    let addr = format!("{}:{}", address, port);

    for attempt in 1..=attempts {
        let stream = TcpStream::connect(addr.clone());
        match time::timeout(CONNECT_TIMEOUT, stream).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => debug!("error while connecting to {}: {}", addr, e),
            Err(e) => debug!("waiting for {} to respond: {}", addr, e),
        }
        if attempt < attempts {
            time::sleep(interval).await;
        }
    }
    Err(Error::ExhaustedAttempts(attempts))
}

/// Single-quotes `word` for the remote shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// `Remote` over the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct Ssh {
    connect_timeout: u64,
    connection_attempts: u32,
}

impl Default for Ssh {
    fn default() -> Self {
        Ssh {
            connect_timeout: 30,
            connection_attempts: 4,
        }
    }
}

impl Ssh {
    fn options(&self, host: &Host) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "NumberOfPasswordPrompts=0".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".into(),
            format!("ConnectionAttempts={}", self.connection_attempts),
        ];
        args.push("-i".into());
        args.push(host.key_file.display().to_string());
        args
    }

    fn ssh(&self, host: &Host, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options(host)).arg(host.to_string()).arg(command);
        cmd
    }
}

fn capture(mut command: Command) -> Result<CommandOutput> {
    debug!("run: {:?}", command);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command.execute_output()?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn check_cmd(command: Command) -> Result<CommandOutput> {
    let description = format!("{:?}", command);
    let output = capture(command)?;
    if output.success() {
        Ok(output)
    } else {
        Err(Error::Command {
            command: description,
            code: output.code,
            stderr: output.stderr,
        })
    }
}

impl Remote for Ssh {
    fn run(&self, host: &Host, command: &str) -> Result<CommandOutput> {
        info!("[{}] run: {}", host, command);
        let output = capture(self.ssh(host, command))?;
        if !output.success() {
            warn!("[{}] `{}` exited with {:?}", host, command, output.code);
        }
        Ok(output)
    }

    fn upload(&self, host: &Host, local: &Path, remote: &str) -> Result<()> {
        info!("[{}] put: {} -> {}", host, local.display(), remote);
        let mut cmd = Command::new("scp");
        cmd.args(self.options(host))
            .arg(local)
            .arg(format!("{}:{}", host, remote));
        check_cmd(cmd)?;
        Ok(())
    }

    fn write(&self, host: &Host, remote: &str, contents: &[u8]) -> Result<()> {
        info!("[{}] write: {} ({} bytes)", host, remote, contents.len());
        let command = format!("cat > {}", shell_quote(remote));
        let mut cmd = self.ssh(host, &command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents)?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Command {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn port(&self) -> Option<u16> {
        Some(22)
    }

    fn read(&self, host: &Host, remote: &str) -> Result<Vec<u8>> {
        info!("[{}] get: {}", host, remote);
        let command = format!("cat {}", shell_quote(remote));
        let mut cmd = self.ssh(host, &command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd.execute_output()?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Command {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}
