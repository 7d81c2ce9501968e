//! Squeezelite child process management
//!
//! Spawns the patched Squeezelite with its stdout piped to the bridge,
//! forwards the passthrough flags, and tears the child down with
//! SIGTERM + reap on shutdown.

use std::io;
use std::process::{Child, ChildStdout, Command, Stdio};

/// Flags forwarded to the child, plus the binary location.
#[derive(Debug, Clone)]
pub struct ChildConfig {
    /// LMS server address (`-s`); autodiscovery when absent.
    pub server: Option<String>,
    /// Player name (`-n`).
    pub name: String,
    /// MAC address (`-m`).
    pub mac: Option<String>,
    /// Model name (`-M`).
    pub model: String,
    /// Codec restriction list (`-c`).
    pub codecs: Option<String>,
    /// Supported sample rates (`-r`).
    pub rates: String,
    /// Sample format (`-a`): 16, 24 or 32.
    pub format_bits: u32,
    /// Read WAV/AIFF headerless (`-W`).
    pub read_wave: bool,
    /// DSD mode (`-D`), with optional `:u32be`/`:u32le`/`dop` value.
    pub dsd: Option<String>,
    /// Child binary path.
    pub binary: String,
    /// Forward `-d all=info` to the child.
    pub verbose: bool,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            server: None,
            name: "squeeze2diretta".into(),
            mac: None,
            model: "SqueezeLite".into(),
            codecs: None,
            rates: "44100-768000".into(),
            format_bits: 24,
            read_wave: false,
            dsd: None,
            binary: "squeezelite".into(),
            verbose: false,
        }
    }
}

/// Child argv; stdout output (`-o -`) is always forced so the audio
/// lands on our pipe.
pub fn build_args(cfg: &ChildConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-o".into(), "-".into()];

    args.push("-n".into());
    args.push(cfg.name.clone());
    args.push("-M".into());
    args.push(cfg.model.clone());
    args.push("-r".into());
    args.push(cfg.rates.clone());
    args.push("-a".into());
    args.push(cfg.format_bits.to_string());

    if let Some(server) = &cfg.server {
        args.push("-s".into());
        args.push(server.clone());
    }
    if let Some(mac) = &cfg.mac {
        args.push("-m".into());
        args.push(mac.clone());
    }
    if let Some(codecs) = &cfg.codecs {
        args.push("-c".into());
        args.push(codecs.clone());
    }
    if cfg.read_wave {
        args.push("-W".into());
    }
    if let Some(dsd) = &cfg.dsd {
        args.push("-D".into());
        if !dsd.is_empty() {
            args.push(dsd.clone());
        }
    }
    if cfg.verbose {
        args.push("-d".into());
        args.push("all=info".into());
    }

    args
}

/// Running child with its piped stdout split off for the bridge.
pub struct SqueezeliteChild {
    child: Child,
}

impl SqueezeliteChild {
    /// Spawn the child; stderr is inherited so its diagnostics land on
    /// the operator's terminal.
    pub fn spawn(cfg: &ChildConfig) -> io::Result<(Self, ChildStdout)> {
        let args = build_args(cfg);
        log::info!("spawning {} {}", cfg.binary, args.join(" "));

        let mut child = Command::new(&cfg.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .expect("stdout is piped by construction");

        log::info!("squeezelite started (pid {})", child.id());
        Ok((Self { child }, stdout))
    }

    /// SIGTERM the child and reap it. Idempotent enough for shutdown
    /// paths: an already-dead child just gets reaped.
    pub fn terminate(&mut self) {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: plain kill(2) on our own child's pid.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        match self.child.wait() {
            Ok(status) => log::info!("squeezelite exited: {status}"),
            Err(e) => log::warn!("failed to reap squeezelite: {e}"),
        }
    }
}
