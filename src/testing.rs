//! In-process fakes for the network, the prompt UI and remote file systems

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::prompt::Prompter;
use crate::sftp::path_utils::{join_remote_path, remote_file_name, remote_parent};
use crate::sftp::{FileInfo, FileSystem, FileType, FsKind, Ownership, SftpError};
use crate::ssh::{
    verify, ChannelCommand, ChannelEvent, ChannelIo, DialOutcome, DialPlan, Dialer, EndpointLabel,
    ExecOutput, Fingerprint, HostKeyVerification, HopSpec, PtySize, SshError, Transport,
};

/// Prompter answering from queues; an exhausted queue reads as cancel
#[derive(Default)]
pub struct ScriptedPrompter {
    secrets: Mutex<VecDeque<String>>,
    choices: Mutex<VecDeque<Option<usize>>>,
    secret_prompts: AtomicUsize,
    choice_prompts: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret(self, value: &str) -> Self {
        self.secrets.lock().push_back(value.to_string());
        self
    }

    pub fn choice(self, value: Option<usize>) -> Self {
        self.choices.lock().push_back(value);
        self
    }

    pub fn secret_prompts(&self) -> usize {
        self.secret_prompts.load(Ordering::SeqCst)
    }

    pub fn choice_prompts(&self) -> usize {
        self.choice_prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn ask_secret(&self, _prompt: &str) -> Option<String> {
        self.secret_prompts.fetch_add(1, Ordering::SeqCst);
        self.secrets.lock().pop_front()
    }

    async fn ask_choice(&self, _message: &str, _options: &[&str]) -> Option<usize> {
        self.choice_prompts.fetch_add(1, Ordering::SeqCst);
        self.choices.lock().pop_front().flatten()
    }

    async fn ask_text(&self, _prompt: &str, default: &str) -> Option<String> {
        Some(default.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Exec(String),
    Shell(PtySize),
}

/// Server side of a channel opened on a [`FakeTransport`]
pub struct FakeChannel {
    pub kind: ChannelKind,
    pub commands: mpsc::Receiver<ChannelCommand>,
    events: mpsc::Sender<ChannelEvent>,
}

impl FakeChannel {
    pub async fn send(&self, data: &[u8]) {
        let _ = self.events.send(ChannelEvent::Data(data.to_vec())).await;
    }

    pub async fn exit(&self, code: u32) {
        let _ = self.events.send(ChannelEvent::ExitStatus(code)).await;
        let _ = self.events.send(ChannelEvent::Closed).await;
    }
}

pub struct FakeTransport {
    endpoint: EndpointLabel,
    closed: watch::Sender<bool>,
    channels: mpsc::UnboundedSender<FakeChannel>,
    fs: Arc<MemoryFileSystem>,
}

impl FakeTransport {
    /// Simulate the peer going away
    pub fn drop_connection(&self) {
        self.closed.send_replace(true);
    }

    fn open_channel(&self, kind: ChannelKind) -> Result<ChannelIo, SshError> {
        if self.is_closed() {
            return Err(SshError::TransportClosed("fake transport closed".to_string()));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let _ = self.channels.send(FakeChannel {
            kind,
            commands: cmd_rx,
            events: event_tx,
        });
        Ok(ChannelIo::new(cmd_tx, event_rx))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn endpoint(&self) -> EndpointLabel {
        self.endpoint
    }

    async fn exec(&self, _command: &str) -> Result<ExecOutput, SshError> {
        Ok(ExecOutput {
            exit_status: Some(0),
            ..Default::default()
        })
    }

    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError> {
        self.open_channel(ChannelKind::Exec(command.to_string()))
    }

    async fn open_shell(&self, size: PtySize) -> Result<ChannelIo, SshError> {
        self.open_channel(ChannelKind::Shell(size))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError> {
        if self.is_closed() {
            return Err(SshError::TransportClosed("fake transport closed".to_string()));
        }
        self.fs.subsystem_ended.send_replace(false);
        Ok(self.fs.clone())
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[derive(Default)]
struct DialerState {
    keys: HashMap<EndpointLabel, Fingerprint>,
    rotating: HashSet<EndpointLabel>,
    rotations: usize,
    failures: VecDeque<SshError>,
    plans: Vec<DialPlan>,
    authenticated: usize,
}

/// [`Dialer`] producing [`FakeTransport`]s, with per-hop host key checks
pub struct FakeDialer {
    state: Mutex<DialerState>,
    gate: Mutex<Option<Arc<Notify>>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    transport_added: Notify,
    channels_tx: mpsc::UnboundedSender<FakeChannel>,
    channels_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeChannel>>,
    fs: Arc<MemoryFileSystem>,
}

impl FakeDialer {
    pub fn new() -> Self {
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(DialerState::default()),
            gate: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            transport_added: Notify::new(),
            channels_tx,
            channels_rx: tokio::sync::Mutex::new(channels_rx),
            fs: Arc::new(MemoryFileSystem::new()),
        }
    }

    pub fn set_server_key(&self, label: EndpointLabel, key: Fingerprint) {
        self.state.lock().keys.insert(label, key);
    }

    /// Present a fresh key for `label` on every dial
    pub fn rotate_server_key_each_dial(&self, label: EndpointLabel) {
        self.state.lock().rotating.insert(label);
    }

    /// Fail the next dial with `err` before any host key check
    pub fn fail_next(&self, err: SshError) -> &Self {
        self.state.lock().failures.push_back(err);
        self
    }

    /// Each dial waits for one `notify_one` on the returned gate
    pub fn hold_dials(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().plans.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.state.lock().authenticated
    }

    pub fn plans(&self) -> Vec<DialPlan> {
        self.state.lock().plans.clone()
    }

    /// Remote file system served by every transport's SFTP subsystem
    pub fn file_system(&self) -> Arc<MemoryFileSystem> {
        self.fs.clone()
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock()[index].clone()
    }

    pub async fn wait_transport(&self, index: usize) -> Arc<FakeTransport> {
        loop {
            let added = self.transport_added.notified();
            if let Some(transport) = self.transports.lock().get(index).cloned() {
                return transport;
            }
            added.await;
        }
    }

    pub async fn next_channel(&self) -> FakeChannel {
        self.channels_rx
            .lock()
            .await
            .recv()
            .await
            .expect("channel sender lives in the dialer")
    }

    fn server_key(state: &mut DialerState, label: EndpointLabel) -> Fingerprint {
        if state.rotating.contains(&label) {
            state.rotations += 1;
            return Fingerprint::of_key_bytes(format!("{}-{}", label, state.rotations).as_bytes());
        }
        state
            .keys
            .get(&label)
            .cloned()
            .unwrap_or_else(|| Fingerprint::of_key_bytes(label.to_string().as_bytes()))
    }

    fn check_hop(state: &mut DialerState, hop: &HopSpec) -> Result<Fingerprint, SshError> {
        let observed = Self::server_key(state, hop.label);
        match verify(&observed, hop.expected.as_ref()) {
            HostKeyVerification::Mismatch { expected, received } => Err(SshError::HostKeyMismatch {
                label: hop.label,
                host: hop.host.clone(),
                expected: expected.display().to_string(),
                received: received.display().to_string(),
            }),
            _ => Ok(observed),
        }
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, plan: &DialPlan) -> Result<DialOutcome, SshError> {
        self.state.lock().plans.push(plan.clone());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let observed = {
            let mut state = self.state.lock();
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            let mut observed = Vec::new();
            if let Some(bastion) = &plan.bastion {
                observed.push((bastion.label, Self::check_hop(&mut state, bastion)?));
            }
            observed.push((plan.target.label, Self::check_hop(&mut state, &plan.target)?));
            state.authenticated += 1;
            observed
        };

        let (closed, _) = watch::channel(false);
        let transport = Arc::new(FakeTransport {
            endpoint: plan.target.label,
            closed,
            channels: self.channels_tx.clone(),
            fs: self.fs.clone(),
        });
        self.transports.lock().push(transport.clone());
        self.transport_added.notify_waiters();

        Ok(DialOutcome {
            transport,
            observed,
        })
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    mode: u32,
    uid: u32,
    gid: u32,
}

/// Remote-style (`/`-separated) file system held in memory
pub struct MemoryFileSystem {
    entries: Mutex<BTreeMap<String, Entry>>,
    subsystem_ended: watch::Sender<bool>,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), dir_entry());
        let (subsystem_ended, _) = watch::channel(false);
        Self {
            entries: Mutex::new(entries),
            subsystem_ended,
        }
    }

    /// Simulate the server ending the SFTP subsystem while the connection stays up
    pub fn end_subsystem(&self) {
        self.subsystem_ended.send_replace(true);
    }

    /// Add a directory and any missing parents
    pub fn add_dir(&self, path: &str) {
        let mut entries = self.entries.lock();
        let mut current = String::from("/");
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = join_remote_path(&current, component);
            entries.entry(current.clone()).or_insert_with(dir_entry);
        }
    }

    /// Add a file, creating missing parents
    pub fn add_file(&self, path: &str, data: &[u8]) {
        if let Some(parent) = remote_parent(path) {
            self.add_dir(&parent);
        }
        self.entries.lock().insert(
            path.to_string(),
            Entry {
                node: Node::File(data.to_vec()),
                mode: 0o644,
                uid: 0,
                gid: 0,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.entries.lock().get(path) {
            Some(Entry {
                node: Node::File(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    fn info(path: &str, entry: &Entry) -> FileInfo {
        let (file_type, size) = match &entry.node {
            Node::Dir => (FileType::Directory, 0),
            Node::File(data) => (FileType::File, data.len() as u64),
        };
        FileInfo {
            name: remote_file_name(path).unwrap_or("/").to_string(),
            path: path.to_string(),
            file_type,
            size,
            modified: 0,
            permissions: entry.mode,
            uid: Some(entry.uid),
            gid: Some(entry.gid),
        }
    }

    fn require_dir(entries: &BTreeMap<String, Entry>, path: &str) -> Result<(), SftpError> {
        match entries.get(path) {
            Some(Entry {
                node: Node::Dir, ..
            }) => Ok(()),
            Some(_) => Err(SftpError::InvalidPath(format!("{} is not a directory", path))),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    fn require_parent(entries: &BTreeMap<String, Entry>, path: &str) -> Result<(), SftpError> {
        let parent = remote_parent(path).ok_or_else(|| SftpError::InvalidPath(path.to_string()))?;
        Self::require_dir(entries, &parent)
    }

    fn children<'a>(entries: &'a BTreeMap<String, Entry>, path: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> {
        entries
            .iter()
            .filter(move |(key, _)| key.as_str() != "/" && remote_parent(key).as_deref() == Some(path))
    }
}

fn dir_entry() -> Entry {
    Entry {
        node: Node::Dir,
        mode: 0o755,
        uid: 0,
        gid: 0,
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    fn kind(&self) -> FsKind {
        FsKind::Remote
    }

    fn join(&self, base: &str, name: &str) -> String {
        join_remote_path(base, name)
    }

    fn parent(&self, path: &str) -> Option<String> {
        remote_parent(path)
    }

    fn file_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        remote_file_name(path)
    }

    async fn home_dir(&self) -> Result<String, SftpError> {
        Ok("/".to_string())
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        let entries = self.entries.lock();
        if entries.contains_key(path) {
            Ok(path.to_string())
        } else {
            Err(SftpError::FileNotFound(path.to_string()))
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let entries = self.entries.lock();
        Self::require_dir(&entries, path)?;
        Ok(Self::children(&entries, path)
            .map(|(key, entry)| Self::info(key, entry))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.entries
            .lock()
            .get(path)
            .map(|entry| Self::info(path, entry))
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(path) {
            return Err(SftpError::AlreadyExists(path.to_string()));
        }
        Self::require_parent(&entries, path)?;
        entries.insert(path.to_string(), dir_entry());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(Entry {
                node: Node::File(_), ..
            }) => {
                entries.remove(path);
                Ok(())
            }
            Some(_) => Err(SftpError::InvalidPath(format!("{} is a directory", path))),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        Self::require_dir(&entries, path)?;
        if Self::children(&entries, path).next().is_some() {
            return Err(SftpError::ProtocolError(format!("{} is not empty", path)));
        }
        entries.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(from) {
            return Err(SftpError::FileNotFound(from.to_string()));
        }
        Self::require_parent(&entries, to)?;
        let prefix = format!("{}/", from);
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| key.as_str() == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = entries.remove(&key) {
                let renamed = format!("{}{}", to, &key[from.len()..]);
                entries.insert(renamed, entry);
            }
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        match self.entries.lock().get(path) {
            Some(Entry {
                node: Node::File(data),
                ..
            }) => Ok(data.clone()),
            Some(_) => Err(SftpError::InvalidPath(format!("{} is a directory", path))),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        Self::require_parent(&entries, path)?;
        match entries.get_mut(path) {
            Some(Entry {
                node: Node::Dir, ..
            }) => Err(SftpError::InvalidPath(format!("{} is a directory", path))),
            Some(entry) => {
                entry.node = Node::File(data.to_vec());
                Ok(())
            }
            None => {
                entries.insert(
                    path.to_string(),
                    Entry {
                        node: Node::File(data.to_vec()),
                        mode: 0o644,
                        uid: 0,
                        gid: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))?;
        entry.mode = mode & 0o7777;
        Ok(())
    }

    async fn set_owner(&self, path: &str, owner: &Ownership) -> Result<(), SftpError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))?;
        match owner {
            Ownership::Ids { uid, gid } => {
                entry.uid = *uid;
                if let Some(gid) = gid {
                    entry.gid = *gid;
                }
                Ok(())
            }
            Ownership::Names { .. } => Err(SftpError::CommandFailed(
                "owner names are not resolvable in memory".to_string(),
            )),
        }
    }

    async fn closed(&self) {
        let mut rx = self.subsystem_ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}
