//! Scripted backends for unit tests.

use async_trait::async_trait;
use hyper::Method;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::docker::transport::{DockerResponse, DockerTransport};
use crate::error::ControlError;
use crate::utils::{CommandOutput, CommandRunner};

#[derive(Clone)]
enum Pm2Script {
    Missing,
    Fail(String),
    Jlist(String),
}

/// `pm2` behaves per script; `bash` succeeds and echoes its command unless
/// the command contains `fail`.
pub struct ScriptedRunner {
    pm2: Mutex<Pm2Script>,
    calls: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(script: Pm2Script) -> Self {
        Self {
            pm2: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
        }
    }

    pub fn missing_pm2() -> Self {
        Self::new(Pm2Script::Missing)
    }

    pub fn failing_pm2(stderr: &str) -> Self {
        Self::new(Pm2Script::Fail(stderr.to_string()))
    }

    pub fn with_jlist(jlist: &str) -> Self {
        Self::new(Pm2Script::Jlist(jlist.to_string()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        if program == "pm2" {
            let script = self.pm2.lock().unwrap().clone();
            return match script {
                Pm2Script::Missing => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "pm2: not found")),
                Pm2Script::Fail(stderr) => Ok(CommandOutput { success: false, code: Some(1), stdout: String::new(), stderr }),
                Pm2Script::Jlist(jlist) => {
                    let stdout = if args.first().map(String::as_str) == Some("jlist") { jlist } else { String::new() };
                    Ok(CommandOutput { success: true, code: Some(0), stdout, stderr: String::new() })
                }
            };
        }
        let ok = !line.contains("fail");
        Ok(CommandOutput {
            success: ok,
            code: Some(if ok { 0 } else { 1 }),
            stdout: format!("ran: {}", args.last().cloned().unwrap_or_default()),
            stderr: if ok { String::new() } else { "command failed".to_string() },
        })
    }

    fn spawn_detached(&self, program: &str, args: &[String]) -> std::io::Result<()> {
        self.detached.lock().unwrap().push(format!("{} {}", program, args.join(" ")));
        Ok(())
    }
}

/// Canned engine responses keyed by `METHOD path`; everything else is 404.
#[derive(Default)]
pub struct MockTransport {
    exact: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    prefixes: Mutex<Vec<(String, u16, Vec<u8>)>>,
    calls: Mutex<Vec<String>>,
    unreachable: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request fails as if the socket were missing.
    pub fn unreachable() -> Self {
        Self { unreachable: true, ..Self::default() }
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: &str) {
        self.respond_bytes(method, path, status, body.as_bytes().to_vec());
    }

    pub fn respond_bytes(&self, method: &str, path: &str, status: u16, body: Vec<u8>) {
        self.exact
            .lock()
            .unwrap()
            .insert(format!("{} {}", method, path), (status, body));
    }

    pub fn respond_prefix(&self, method: &str, prefix: &str, status: u16, body: &str) {
        self.prefixes
            .lock()
            .unwrap()
            .push((format!("{} {}", method, prefix), status, body.as_bytes().to_vec()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DockerTransport for MockTransport {
    async fn request(&self, method: Method, path: &str) -> Result<DockerResponse, ControlError> {
        let key = format!("{} {}", method, path);
        self.calls.lock().unwrap().push(key.clone());
        if self.unreachable {
            return Err(ControlError::DockerFailed("connect: No such file or directory".to_string()));
        }
        if let Some((status, body)) = self.exact.lock().unwrap().get(&key) {
            return Ok(DockerResponse { status: *status, body: body.clone() });
        }
        let prefixes = self.prefixes.lock().unwrap();
        if let Some((_, status, body)) = prefixes.iter().find(|(p, _, _)| key.starts_with(p.as_str())) {
            return Ok(DockerResponse { status: *status, body: body.clone() });
        }
        Ok(DockerResponse { status: 404, body: b"{\"message\":\"No such container\"}".to_vec() })
    }
}
