//! In-memory fakes for the cluster, remote shell, probe and operator

use crate::cluster::{
    BoxedReader, ClusterAccess, ClusterClient, ExecOutput, ExitStatus, RemoteStreams, StreamOptions,
};
use crate::environment::ShardSet;
use crate::error::{DebugError, Result};
use crate::interaction::{Choice, InteractionCapability};
use crate::probe::{ProbeMode, ProbeOverride};
use crate::remote::RemoteShell;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, EphemeralContainer, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta, Status, StatusCause, StatusDetails,
};
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Gzip-compress `data`
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Status object the API server sends when a process exits with `code`
pub fn exit_status(code: i32) -> Status {
    if code == 0 {
        return Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
    }
    Status {
        status: Some("Failure".to_string()),
        reason: Some("NonZeroExitCode".to_string()),
        message: Some(format!("command terminated with non-zero exit code: {}", code)),
        details: Some(StatusDetails {
            causes: Some(vec![StatusCause {
                reason: Some("ExitCode".to_string()),
                message: Some(code.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Streams of a finished remote process with the given output
pub fn streams_from(stdout: BoxedReader, stderr: Option<BoxedReader>, status: Status) -> RemoteStreams {
    RemoteStreams {
        stdin: None,
        stdout: Some(stdout),
        stderr,
        resize: None,
        status: async move { Some(status) }.boxed(),
        finished: async { Ok(()) }.boxed(),
    }
}

fn game_server_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "shard-server".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "shard-server".to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// How [`FakeCluster`] answers a wait for a debug container
#[derive(Debug, Clone, Copy)]
pub enum FakeWait {
    Running,
    Hang,
    Terminated(i32),
}

/// Canned output of one exec
#[derive(Debug, Clone)]
pub struct FakeExec {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i32,
    refused: Option<String>,
}

impl FakeExec {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            code: 0,
            refused: None,
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            code,
            refused: None,
        }
    }

    /// The stream cannot be opened at all
    pub fn refused(message: &str) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            code: 0,
            refused: Some(message.to_string()),
        }
    }

    fn open(&self) -> Result<RemoteStreams> {
        match &self.refused {
            Some(message) => Err(DebugError::Transport(message.clone())),
            None => Ok(self.streams()),
        }
    }

    fn streams(&self) -> RemoteStreams {
        streams_from(
            Box::new(Cursor::new(self.stdout.clone())),
            Some(Box::new(Cursor::new(self.stderr.clone()))),
            exit_status(self.code),
        )
    }
}

#[derive(Default)]
struct ClusterState {
    calls: Vec<String>,
    exec_calls: Vec<String>,
    ephemeral: Vec<EphemeralContainer>,
    responses: Vec<(String, FakeExec)>,
}

/// One cluster holding shard sets of running game server pods
pub struct FakeCluster {
    name: String,
    shard_sets: Vec<(String, Vec<Pod>)>,
    wait: FakeWait,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shard_sets: Vec::new(),
            wait: FakeWait::Running,
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn with_shard_set(mut self, name: &str, pods: &[&str]) -> Self {
        let pods = pods.iter().map(|p| game_server_pod(p)).collect();
        self.shard_sets.push((name.to_string(), pods));
        self
    }

    pub fn with_wait(mut self, wait: FakeWait) -> Self {
        self.wait = wait;
        self
    }

    pub fn client(self: &Arc<Self>) -> ClusterClient {
        ClusterClient::from_arc(self.clone())
    }

    pub fn shard_set(self: &Arc<Self>, name: &str) -> ShardSet {
        ShardSet {
            name: name.to_string(),
            cluster: self.client(),
        }
    }

    pub fn pod(&self, name: &str) -> Pod {
        self.find(name).unwrap()
    }

    /// Answer execs whose command line contains `pattern`; later registrations win
    pub fn respond(&self, pattern: &str, exec: FakeExec) {
        self.state.lock().unwrap().responses.push((pattern.to_string(), exec));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn exec_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    pub fn ephemeral_containers(&self) -> Vec<EphemeralContainer> {
        self.state.lock().unwrap().ephemeral.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn find(&self, name: &str) -> Option<Pod> {
        self.shard_sets
            .iter()
            .flat_map(|(_, pods)| pods)
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    fn response_for(&self, command: &str) -> FakeExec {
        self.state
            .lock()
            .unwrap()
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, exec)| exec.clone())
            .unwrap_or_else(|| FakeExec::ok(Vec::new()))
    }
}

#[async_trait]
impl ClusterAccess for FakeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        "game"
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.record(format!("get_pod {}", name));
        self.find(name).ok_or_else(|| DebugError::PodNotFound {
            pod: name.to_string(),
        })
    }

    async fn list_shard_sets(&self) -> Result<Vec<String>> {
        self.record("list_shard_sets".to_string());
        Ok(self.shard_sets.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn list_shard_set_pods(&self, shard_set: &str) -> Result<Vec<Pod>> {
        self.record(format!("list_shard_set_pods {}", shard_set));
        Ok(self
            .shard_sets
            .iter()
            .find(|(name, _)| name == shard_set)
            .map(|(_, pods)| pods.clone())
            .unwrap_or_default())
    }

    async fn add_ephemeral_container(&self, pod: &str, container: EphemeralContainer) -> Result<()> {
        self.record(format!("add_ephemeral_container {} {}", pod, container.name));
        self.state.lock().unwrap().ephemeral.push(container);
        Ok(())
    }

    async fn wait_ephemeral_running(&self, pod: &str, container: &str) -> Result<()> {
        self.record(format!("wait_ephemeral_running {} {}", pod, container));
        match self.wait {
            FakeWait::Running => Ok(()),
            FakeWait::Hang => std::future::pending().await,
            FakeWait::Terminated(exit_code) => Err(DebugError::ContainerTerminated {
                container: container.to_string(),
                exit_code,
                message: "executable file not found".to_string(),
            }),
        }
    }

    async fn exec(
        &self,
        _pod: &str,
        container: &str,
        command: Vec<String>,
        _options: StreamOptions,
    ) -> Result<RemoteStreams> {
        let call = format!("exec {} {}", container, command.join(" "));
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            state.exec_calls.push(call);
        }
        self.response_for(&command.join(" ")).open()
    }

    async fn attach(&self, _pod: &str, container: &str, _options: StreamOptions) -> Result<RemoteStreams> {
        self.record(format!("attach {}", container));
        self.response_for("attach").open()
    }
}

#[derive(Debug, Clone)]
enum ShellResponse {
    Output(String),
    Fail(i32),
    Hang,
}

#[derive(Default)]
struct ShellState {
    commands: Vec<String>,
    downloads: Vec<String>,
}

/// Scripted [`RemoteShell`]; clones share recorded commands
#[derive(Clone, Default)]
pub struct FakeShell {
    responses: Vec<(String, ShellResponse)>,
    artifact: Vec<u8>,
    download_fails: bool,
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer scripts containing `pattern` with `stdout`; later registrations win
    pub fn respond(mut self, pattern: &str, stdout: &str) -> Self {
        self.responses
            .push((pattern.to_string(), ShellResponse::Output(stdout.to_string())));
        self
    }

    pub fn fail(mut self, pattern: &str, code: i32) -> Self {
        self.responses.push((pattern.to_string(), ShellResponse::Fail(code)));
        self
    }

    pub fn hang(mut self, pattern: &str) -> Self {
        self.responses.push((pattern.to_string(), ShellResponse::Hang));
        self
    }

    /// Contents written by every download
    pub fn artifact(mut self, content: Vec<u8>) -> Self {
        self.artifact = content;
        self
    }

    pub fn fail_download(mut self) -> Self {
        self.download_fails = true;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state.lock().unwrap().downloads.clone()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(&self, script: &str) -> Result<ExecOutput> {
        self.state.lock().unwrap().commands.push(script.to_string());

        let response = self
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| ShellResponse::Output(String::new()));

        match response {
            ShellResponse::Output(stdout) => Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit: ExitStatus::Success,
            }),
            ShellResponse::Fail(code) => Err(DebugError::RemoteExit {
                code,
                stderr: String::new(),
            }),
            ShellResponse::Hang => std::future::pending().await,
        }
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.state.lock().unwrap().downloads.push(remote_path.to_string());
        if self.download_fails {
            return Err(DebugError::Transport("connection reset during copy".to_string()));
        }
        std::fs::write(local_path, &self.artifact)?;
        Ok(self.artifact.len() as u64)
    }
}

/// Records probe mode changes, optionally refusing one mode
#[derive(Default)]
pub struct FakeProbe {
    failing: Option<ProbeMode>,
    modes: Mutex<Vec<ProbeMode>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mode: ProbeMode) -> Self {
        Self {
            failing: Some(mode),
            ..Default::default()
        }
    }

    pub fn modes(&self) -> Vec<ProbeMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProbeOverride for FakeProbe {
    async fn set_mode(&self, mode: ProbeMode) -> Result<()> {
        self.modes.lock().unwrap().push(mode);
        if self.failing == Some(mode) {
            return Err(DebugError::Remote(format!(
                "failed to set health probe override to {}",
                mode
            )));
        }
        Ok(())
    }
}

/// Operator that answers prompts from a script
pub struct ScriptedInteraction {
    choices: Mutex<VecDeque<usize>>,
    confirm: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn interactive(choices: Vec<usize>) -> Self {
        Self {
            choices: Mutex::new(choices.into()),
            confirm: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn confirming(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl InteractionCapability for ScriptedInteraction {
    fn is_interactive(&self) -> bool {
        true
    }

    fn choose(&self, title: &str, _choices: &[Choice]) -> Result<usize> {
        self.prompts.lock().unwrap().push(title.to_string());
        self.choices
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DebugError::InvalidArgument(format!("no scripted answer for '{}'", title)))
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.confirm)
    }
}

/// Collects warnings logged on the current thread while it is alive
pub struct WarningCapture {
    buffer: LogBuffer,
    _guard: tracing::subscriber::DefaultGuard,
}

impl WarningCapture {
    pub fn start() -> Self {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(buffer.clone())
            .finish();
        Self {
            _guard: tracing::subscriber::set_default(subscriber),
            buffer,
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.0.lock().unwrap()).into_owned()
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
