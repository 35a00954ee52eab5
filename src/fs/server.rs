//! Enhanced ISO 11783-13 file server: TAN idempotency, directory tree, volume lifecycle.

use std::collections::HashMap;

use crate::event::{Event, StateMachine};
use crate::fs::error_codes::{FSError, FileAttributes, OpenFlags};
use crate::fs::types::{
    pack_dos_date, pack_dos_time, FSFunction, FileEntry, FileHandle, FileServerProperties,
    FileServerStatus, Tan, TanResponse, VolumeState, INVALID_FILE_HANDLE, INVALID_TAN,
    RESERVED_FILE_HANDLE_0,
};
use crate::network::Message;
use crate::types::{Address, Config, Result, NULL_ADDRESS};

pub const PGN_FILE_CLIENT_TO_SERVER: u32 = 0xAA00;
pub const PGN_FILE_SERVER_TO_CLIENT: u32 = 0xAB00;

const CCM_FUNCTION_CODE: u8 = 0xFF;

struct ClientConnection {
    last_ccm_timestamp_ms: u32,
    current_directory: String,
    open_handles: Vec<FileHandle>,
    tan_cache: HashMap<Tan, TanResponse>,
}

impl ClientConnection {
    fn new() -> Self {
        Self {
            last_ccm_timestamp_ms: 0,
            current_directory: "\\".to_string(),
            open_handles: Vec::new(),
            tan_cache: HashMap::new(),
        }
    }

    fn is_connected(&self, current_time_ms: u32, timeout_ms: u32) -> bool {
        current_time_ms.wrapping_sub(self.last_ccm_timestamp_ms) <= timeout_ms
    }
}

struct OpenFile {
    handle: FileHandle,
    owner: Address,
    path: String,
    is_directory: bool,
    position: u32,
    flags: OpenFlags,
}

/// Tunables for [`FileServer`].
#[derive(Debug, Clone, Copy)]
pub struct FileServerConfig {
    pub status_broadcast_interval_ms: u32,
    pub busy_status_interval_ms: u32,
    pub ccm_timeout_ms: u32,
    pub tan_cache_timeout_ms: u32,
    pub max_open_files_per_client: u8,
    pub max_open_files_total: u8,
    pub volume_max_removal_time_ms: u32,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            status_broadcast_interval_ms: 2000,
            busy_status_interval_ms: 200,
            ccm_timeout_ms: 6000,
            tan_cache_timeout_ms: 10000,
            max_open_files_per_client: 8,
            max_open_files_total: 32,
            volume_max_removal_time_ms: 10000,
        }
    }
}

impl Config for FileServerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_open_files_per_client == 0 || self.max_open_files_total == 0 {
            return Err(crate::error::IsobusError::InvalidArgument(
                "file server must allow at least one open file".into(),
            ));
        }
        Ok(())
    }
}

/// Outbound frames accumulated by a server tick or message handling call.
#[derive(Debug, Default)]
pub struct FsOutcome {
    pub outbound: Vec<(Address, Vec<u8>)>,
}

/// ISO 11783-13 file server: directory tree, open-file table, TAN idempotency cache,
/// and the volume removal state machine.
pub struct FileServer {
    config: FileServerConfig,
    files: HashMap<String, Vec<u8>>,
    file_attrs: HashMap<String, FileAttributes>,
    directories: Vec<String>,
    open_files: Vec<OpenFile>,
    next_handle: FileHandle,
    clients: HashMap<Address, ClientConnection>,
    busy: bool,
    status_timer_ms: u32,
    now_ms: u32,
    volume_state: StateMachine<VolumeState>,
    volume_removal_timer_ms: u32,
    volume_maintain_requests: Vec<Address>,
    properties: FileServerProperties,

    pub on_client_connected: Event<Address>,
    pub on_client_disconnected: Event<Address>,
    pub on_file_opened: Event<(Address, String)>,
    pub on_file_closed: Event<(Address, FileHandle)>,
    pub on_volume_removed: Event<()>,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Self {
        let properties = FileServerProperties {
            max_simultaneous_files: config.max_open_files_total,
            ..Default::default()
        };
        Self {
            config,
            files: HashMap::new(),
            file_attrs: HashMap::new(),
            directories: vec!["\\".to_string()],
            open_files: Vec::new(),
            next_handle: 1,
            clients: HashMap::new(),
            busy: false,
            status_timer_ms: 0,
            now_ms: 0,
            volume_state: StateMachine::new(VolumeState::Present),
            volume_removal_timer_ms: 0,
            volume_maintain_requests: Vec::new(),
            properties,
            on_client_connected: Event::new(),
            on_client_disconnected: Event::new(),
            on_file_opened: Event::new(),
            on_file_closed: Event::new(),
            on_volume_removed: Event::new(),
        }
    }

    pub fn add_file(&mut self, path: impl Into<String>, data: Vec<u8>, attrs: FileAttributes) {
        let path = path.into();
        self.files.insert(path.clone(), data);
        self.file_attrs.insert(path, attrs);
    }

    pub fn add_directory(&mut self, path: impl Into<String>) {
        let mut path = path.into();
        if !path.ends_with('\\') {
            path.push('\\');
        }
        self.directories.push(path);
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        self.directories.iter().any(|d| d == path)
    }

    pub fn list_directory(&self, path: &str, pattern: &str) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        for (file_path, data) in &self.files {
            if let Some(filename) = file_path.strip_prefix(path) {
                if !filename.is_empty() && (pattern == "*" || wildcard_match(filename, pattern)) {
                    entries.push(FileEntry {
                        name: filename.to_string(),
                        size: data.len() as u32,
                        attributes: self
                            .file_attrs
                            .get(file_path)
                            .copied()
                            .unwrap_or(FileAttributes::empty()),
                        date: pack_dos_date(2025, 1, 1),
                        time: pack_dos_time(12, 0, 0),
                    });
                }
            }
        }
        for dir in &self.directories {
            if dir == path {
                continue;
            }
            if let Some(subdir) = dir.strip_prefix(path) {
                if !subdir.is_empty() {
                    let trimmed = subdir.trim_end_matches('\\');
                    if trimmed.contains('\\') {
                        continue;
                    }
                    entries.push(FileEntry {
                        name: trimmed.to_string(),
                        size: 0,
                        attributes: FileAttributes::DIRECTORY,
                        date: pack_dos_date(2025, 1, 1),
                        time: pack_dos_time(12, 0, 0),
                    });
                }
            }
        }
        entries
    }

    pub fn properties(&self) -> FileServerProperties {
        self.properties
    }

    pub fn volume_state(&self) -> VolumeState {
        self.volume_state.state()
    }

    pub fn prepare_volume_for_removal(&mut self) -> Result<()> {
        match self.volume_state.state() {
            VolumeState::Present | VolumeState::InUse => {
                self.volume_state.transition(VolumeState::PreparingForRemoval);
                self.volume_removal_timer_ms = 0;
                self.volume_maintain_requests.clear();
                Ok(())
            }
            _ => Err(crate::error::IsobusError::InvalidState(
                "volume not in a removable state".into(),
            )),
        }
    }

    pub fn receive_volume_maintain_request(&mut self, client: Address) {
        if self.volume_state.state() != VolumeState::PreparingForRemoval {
            return;
        }
        if !self.volume_maintain_requests.contains(&client) {
            self.volume_maintain_requests.push(client);
        }
    }

    pub fn clear_volume_maintain_request(&mut self, client: Address) {
        self.volume_maintain_requests.retain(|&a| a != client);
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Process one inbound client-to-server message, returning any response/broadcast to send.
    pub fn handle_message(&mut self, msg: &Message) -> FsOutcome {
        let mut outcome = FsOutcome::default();
        if msg.pgn != PGN_FILE_CLIENT_TO_SERVER || msg.payload.len() < 2 {
            return outcome;
        }
        let function = msg.payload[0];
        let tan = msg.payload[1];
        let client = msg.source;

        self.clients.entry(client).or_insert_with(ClientConnection::new);

        if function == CCM_FUNCTION_CODE {
            self.handle_ccm(client);
            return outcome;
        }

        if let Some(cached) = self.clients[&client].tan_cache.get(&tan) {
            outcome.outbound.push((client, cached.response_data.clone()));
            return outcome;
        }

        let response = self.execute_function(client, function, tan, &msg.payload);
        self.clients.get_mut(&client).unwrap().tan_cache.insert(
            tan,
            TanResponse {
                tan,
                response_data: response.clone(),
                timestamp_ms: self.now_ms,
            },
        );
        outcome.outbound.push((client, response));
        outcome
    }

    fn handle_ccm(&mut self, client: Address) {
        let now_ms = self.now_ms;
        let ccm_timeout_ms = self.config.ccm_timeout_ms;
        let conn = self.clients.entry(client).or_insert_with(ClientConnection::new);
        let was_connected = conn.is_connected(now_ms, ccm_timeout_ms);
        conn.last_ccm_timestamp_ms = now_ms;
        if !was_connected {
            self.on_client_connected.emit(client);
        }
    }

    fn execute_function(&mut self, client: Address, function_code: u8, tan: Tan, request: &[u8]) -> Vec<u8> {
        match function_code {
            c if c == FSFunction::OpenFile as u8 => self.handle_open_file(client, tan, request),
            c if c == FSFunction::CloseFile as u8 => self.handle_close_file(client, tan, request),
            c if c == FSFunction::ReadFile as u8 => self.handle_read_file(client, tan, request),
            c if c == FSFunction::WriteFile as u8 => self.handle_write_file(client, tan, request),
            c if c == FSFunction::SeekFile as u8 => self.handle_seek_file(client, tan, request),
            c if c == FSFunction::GetFileServerProperties as u8 => self.handle_get_properties(tan),
            c if c == FSFunction::FileServerStatus as u8 => self.handle_get_status(tan),
            c if c == FSFunction::GetCurrentDirectory as u8 => self.handle_get_current_directory(client, tan),
            c if c == FSFunction::ChangeDirectory as u8 => self.handle_change_directory(client, tan, request),
            _ => encode_error_response(function_code, tan, FSError::NotSupported),
        }
    }

    fn handle_open_file(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 4 {
            return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::MalformedRequest);
        }
        let path_len = request[2] as usize;
        let flags = OpenFlags::from_bits_truncate(request[3]);
        if request.len() < 4 + path_len {
            return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::MalformedRequest);
        }
        let path = String::from_utf8_lossy(&request[4..4 + path_len]).into_owned();
        let is_dir_listing = flags.access_mode() == OpenFlags::OPEN_DIR;

        let open_count = self.clients.get(&client).map(|c| c.open_handles.len()).unwrap_or(0);
        if open_count >= self.config.max_open_files_per_client as usize {
            return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::TooManyOpen);
        }
        if self.open_files.len() >= self.config.max_open_files_total as usize {
            return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::MaxHandles);
        }

        if is_dir_listing {
            let mut dir_path = path.clone();
            if !dir_path.ends_with('\\') {
                dir_path.push('\\');
            }
            if !self.directory_exists(&dir_path) {
                return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::NotFound);
            }
        } else if !self.files.contains_key(&path) {
            if !flags.contains(OpenFlags::CREATE) {
                return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::NotFound);
            }
            self.files.insert(path.clone(), Vec::new());
            self.file_attrs.insert(path.clone(), FileAttributes::empty());
        }

        let handle = self.allocate_handle();
        if handle == INVALID_FILE_HANDLE {
            return encode_error_response(FSFunction::OpenFile as u8, tan, FSError::MaxHandles);
        }

        self.open_files.push(OpenFile {
            handle,
            owner: client,
            path: path.clone(),
            is_directory: is_dir_listing,
            position: 0,
            flags,
        });
        self.clients.get_mut(&client).unwrap().open_handles.push(handle);
        self.on_file_opened.emit((client, path));

        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::OpenFile as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3] = handle;
        response.to_vec()
    }

    fn handle_close_file(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 {
            return encode_error_response(FSFunction::CloseFile as u8, tan, FSError::MalformedRequest);
        }
        let handle = request[2];
        if let Some(pos) = self
            .open_files
            .iter()
            .position(|f| f.handle == handle && f.owner == client)
        {
            self.open_files.remove(pos);
            if let Some(conn) = self.clients.get_mut(&client) {
                conn.open_handles.retain(|&h| h != handle);
            }
            self.on_file_closed.emit((client, handle));
            let mut response = [0xFFu8; 8];
            response[0] = FSFunction::CloseFile as u8;
            response[1] = tan;
            response[2] = FSError::Success as u8;
            return response.to_vec();
        }
        encode_error_response(FSFunction::CloseFile as u8, tan, FSError::InvalidHandle)
    }

    fn handle_read_file(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 4 {
            return encode_error_response(FSFunction::ReadFile as u8, tan, FSError::MalformedRequest);
        }
        let handle = request[2];
        let count = request[3] as usize;
        let Some(open_file) = self
            .open_files
            .iter_mut()
            .find(|f| f.handle == handle && f.owner == client)
        else {
            return encode_error_response(FSFunction::ReadFile as u8, tan, FSError::InvalidHandle);
        };
        if open_file.is_directory {
            return encode_error_response(FSFunction::ReadFile as u8, tan, FSError::InvalidHandle);
        }
        let Some(data) = self.files.get(&open_file.path) else {
            log::warn!("open handle {} points at a deleted file", handle);
            return encode_error_response(FSFunction::ReadFile as u8, tan, FSError::NotFound);
        };
        if open_file.position as usize >= data.len() {
            return encode_error_response(FSFunction::ReadFile as u8, tan, FSError::Eof);
        }
        let available = data.len() - open_file.position as usize;
        let to_read = count.min(available).min(4);

        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::ReadFile as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3] = to_read as u8;
        for i in 0..to_read {
            response[4 + i] = data[open_file.position as usize + i];
        }
        open_file.position += to_read as u32;
        response.to_vec()
    }

    fn handle_write_file(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 4 {
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::MalformedRequest);
        }
        let handle = request[2];
        let count = request[3] as usize;
        if request.len() < 4 + count {
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::MalformedRequest);
        }
        let Some(open_file) = self
            .open_files
            .iter_mut()
            .find(|f| f.handle == handle && f.owner == client)
        else {
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::InvalidHandle);
        };
        if open_file.is_directory {
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::InvalidHandle);
        }
        let mode = open_file.flags.access_mode();
        if mode != OpenFlags::WRITE && mode != OpenFlags::READ_WRITE {
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::InvalidAccess);
        }
        let Some(data) = self.files.get_mut(&open_file.path) else {
            log::warn!("open handle {} points at a deleted file", handle);
            return encode_error_response(FSFunction::WriteFile as u8, tan, FSError::NotFound);
        };
        let end = open_file.position as usize + count;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[open_file.position as usize..end].copy_from_slice(&request[4..4 + count]);
        open_file.position += count as u32;

        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::WriteFile as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3] = count as u8;
        response.to_vec()
    }

    fn handle_seek_file(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 7 {
            return encode_error_response(FSFunction::SeekFile as u8, tan, FSError::MalformedRequest);
        }
        let handle = request[2];
        let position = u32::from_le_bytes([request[3], request[4], request[5], request[6]]);
        let Some(open_file) = self
            .open_files
            .iter_mut()
            .find(|f| f.handle == handle && f.owner == client)
        else {
            return encode_error_response(FSFunction::SeekFile as u8, tan, FSError::InvalidHandle);
        };
        open_file.position = position;
        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::SeekFile as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response.to_vec()
    }

    fn handle_get_properties(&self, tan: Tan) -> Vec<u8> {
        let props = self.properties.encode();
        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::GetFileServerProperties as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3..].copy_from_slice(&props[..5]);
        response.to_vec()
    }

    fn handle_get_status(&self, tan: Tan) -> Vec<u8> {
        let status = FileServerStatus {
            busy: self.busy,
            number_of_open_files: self.open_files.len() as u8,
        };
        let data = status.encode();
        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::FileServerStatus as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3..].copy_from_slice(&data[..5]);
        response.to_vec()
    }

    fn handle_get_current_directory(&self, client: Address, tan: Tan) -> Vec<u8> {
        let empty = "\\".to_string();
        let cwd = self
            .clients
            .get(&client)
            .map(|c| &c.current_directory)
            .unwrap_or(&empty);
        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::GetCurrentDirectory as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response[3] = cwd.len() as u8;
        for (i, b) in cwd.bytes().take(4).enumerate() {
            response[4 + i] = b;
        }
        response.to_vec()
    }

    fn handle_change_directory(&mut self, client: Address, tan: Tan, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 {
            return encode_error_response(FSFunction::ChangeDirectory as u8, tan, FSError::MalformedRequest);
        }
        let path_len = request[2] as usize;
        if request.len() < 3 + path_len {
            return encode_error_response(FSFunction::ChangeDirectory as u8, tan, FSError::MalformedRequest);
        }
        let path = String::from_utf8_lossy(&request[3..3 + path_len]).into_owned();
        let conn = self.clients.entry(client).or_insert_with(ClientConnection::new);

        if path == ".." {
            if conn.current_directory != "\\" {
                let trimmed = conn.current_directory.trim_end_matches('\\');
                conn.current_directory = match trimmed.rfind('\\') {
                    Some(idx) => trimmed[..=idx].to_string(),
                    None => "\\".to_string(),
                };
            }
        } else if path == "." {
            // no-op
        } else if path.is_empty() || path == "\\" {
            conn.current_directory = "\\".to_string();
        } else {
            let mut target = if crate::fs::types::is_absolute_path(&path) {
                path
            } else {
                let mut t = conn.current_directory.clone();
                if !t.ends_with('\\') {
                    t.push('\\');
                }
                t.push_str(&path);
                t
            };
            if !target.ends_with('\\') {
                target.push('\\');
            }
            if !self.directory_exists(&target) {
                return encode_error_response(FSFunction::ChangeDirectory as u8, tan, FSError::NotFound);
            }
            self.clients.get_mut(&client).unwrap().current_directory = target;
        }

        let mut response = [0xFFu8; 8];
        response[0] = FSFunction::ChangeDirectory as u8;
        response[1] = tan;
        response[2] = FSError::Success as u8;
        response.to_vec()
    }

    fn allocate_handle(&mut self) -> FileHandle {
        for _ in 0..255u16 {
            let candidate = self.next_handle;
            self.next_handle = self.next_handle.wrapping_add(1);
            if self.next_handle == 0 || self.next_handle == INVALID_FILE_HANDLE {
                self.next_handle = 1;
            }
            if candidate != INVALID_FILE_HANDLE
                && candidate != RESERVED_FILE_HANDLE_0
                && !self.open_files.iter().any(|f| f.handle == candidate)
            {
                return candidate;
            }
        }
        INVALID_FILE_HANDLE
    }

    fn cleanup_expired_tan_cache(&mut self) {
        let now_ms = self.now_ms;
        let timeout_ms = self.config.tan_cache_timeout_ms;
        for conn in self.clients.values_mut() {
            conn.tan_cache.retain(|_, cached| !cached.is_expired(now_ms, timeout_ms));
        }
    }

    fn cleanup_disconnected_clients(&mut self) -> Vec<Address> {
        let now_ms = self.now_ms;
        let timeout_ms = self.config.ccm_timeout_ms;
        let stale: Vec<Address> = self
            .clients
            .iter()
            .filter(|(_, c)| !c.is_connected(now_ms, timeout_ms))
            .map(|(&addr, _)| addr)
            .collect();
        for &addr in &stale {
            self.open_files.retain(|f| f.owner != addr);
            self.clients.remove(&addr);
            self.on_client_disconnected.emit(addr);
        }
        stale
    }

    fn update_volume_state_machine(&mut self, elapsed_ms: u32) {
        match self.volume_state.state() {
            VolumeState::Present if !self.open_files.is_empty() => {
                self.volume_state.transition(VolumeState::InUse);
            }
            VolumeState::InUse if self.open_files.is_empty() => {
                self.volume_state.transition(VolumeState::Present);
            }
            VolumeState::PreparingForRemoval => {
                self.volume_removal_timer_ms += elapsed_ms;
                let all_closed = self.open_files.is_empty();
                let no_maintain = self.volume_maintain_requests.is_empty();
                let timed_out = self.volume_removal_timer_ms >= self.config.volume_max_removal_time_ms;
                if (all_closed && no_maintain) || timed_out {
                    self.volume_state.transition(VolumeState::Removed);
                    self.open_files.clear();
                    self.on_volume_removed.emit(());
                }
            }
            _ => {}
        }
    }

    fn volume_status_broadcast(&self) -> Vec<u8> {
        let mut data = [0xFFu8; 8];
        data[0] = FSFunction::VolumeStatus as u8;
        data[1] = INVALID_TAN;
        data[2] = self.volume_state.state() as u8;
        data[3] = self.open_files.len() as u8;
        data.to_vec()
    }

    fn status_broadcast(&self) -> Vec<u8> {
        FileServerStatus {
            busy: self.busy,
            number_of_open_files: self.open_files.len() as u8,
        }
        .encode()
        .to_vec()
    }

    /// Advance all timers, evicting stale TAN entries and disconnected clients, and producing
    /// periodic broadcasts. Must be called regularly from the host application's main loop.
    pub fn update(&mut self, elapsed_ms: u32) -> FsOutcome {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);
        let was_preparing = self.volume_state.state() == VolumeState::PreparingForRemoval;
        self.update_volume_state_machine(elapsed_ms);
        self.cleanup_expired_tan_cache();
        self.cleanup_disconnected_clients();

        let mut outcome = FsOutcome::default();
        if was_preparing && self.volume_state.state() == VolumeState::Removed {
            outcome
                .outbound
                .push((NULL_ADDRESS, self.volume_status_broadcast()));
        }

        self.status_timer_ms += elapsed_ms;
        let interval = if self.busy {
            self.config.busy_status_interval_ms
        } else {
            self.config.status_broadcast_interval_ms
        };
        if self.status_timer_ms >= interval {
            self.status_timer_ms = 0;
            outcome.outbound.push((NULL_ADDRESS, self.status_broadcast()));
        }
        outcome
    }
}

fn encode_error_response(function: u8, tan: Tan, error: FSError) -> Vec<u8> {
    let mut response = [0xFFu8; 8];
    response[0] = function;
    response[1] = tan;
    response[2] = error as u8;
    response.to_vec()
}

fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut s, mut p) = (0usize, 0usize);
    let mut star_idx: Option<usize> = None;
    let mut match_idx = 0usize;

    while s < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[s]) {
            s += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star_idx = Some(p);
            match_idx = s;
            p += 1;
        } else if let Some(star) = star_idx {
            p = star + 1;
            match_idx += 1;
            s = match_idx;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(source: Address, payload: Vec<u8>) -> Message {
        Message {
            pgn: PGN_FILE_CLIENT_TO_SERVER,
            priority: 6,
            source,
            destination: 0x10,
            payload,
            timestamp: 0,
        }
    }

    #[test]
    fn open_nonexistent_file_without_create_flag_fails() {
        let mut server = FileServer::new(FileServerConfig::default());
        let msg = sample_message(5, vec![FSFunction::OpenFile as u8, 1, 4, OpenFlags::READ.bits(), b'A', b'B', b'C', b'D']);
        let outcome = server.handle_message(&msg);
        assert_eq!(outcome.outbound[0].1[2], FSError::NotFound as u8);
    }

    #[test]
    fn open_with_create_then_write_then_read_roundtrips() {
        let mut server = FileServer::new(FileServerConfig::default());
        let open = sample_message(
            5,
            vec![FSFunction::OpenFile as u8, 1, 4, OpenFlags::CREATE.bits() | OpenFlags::READ_WRITE.bits(), b'A', b'B', b'C', b'D'],
        );
        let response = server.handle_message(&open).outbound.remove(0).1;
        assert_eq!(response[2], FSError::Success as u8);
        let handle = response[3];

        let write = sample_message(5, vec![FSFunction::WriteFile as u8, 2, handle, 3, b'x', b'y', b'z']);
        let write_response = server.handle_message(&write).outbound.remove(0).1;
        assert_eq!(write_response[2], FSError::Success as u8);

        let seek = sample_message(5, vec![FSFunction::SeekFile as u8, 3, handle, 0, 0, 0, 0]);
        server.handle_message(&seek);

        let read = sample_message(5, vec![FSFunction::ReadFile as u8, 4, handle, 3]);
        let read_response = server.handle_message(&read).outbound.remove(0).1;
        assert_eq!(read_response[2], FSError::Success as u8);
        let count = read_response[3] as usize;
        assert_eq!(&read_response[4..4 + count], b"xyz");
    }

    #[test]
    fn repeated_tan_returns_cached_response_without_reexecuting() {
        let mut server = FileServer::new(FileServerConfig::default());
        let open = sample_message(
            5,
            vec![FSFunction::OpenFile as u8, 7, 4, OpenFlags::CREATE.bits(), b'A', b'B', b'C', b'D'],
        );
        let first = server.handle_message(&open).outbound.remove(0).1;
        let second = server.handle_message(&open).outbound.remove(0).1;
        assert_eq!(first, second);
    }

    #[test]
    fn volume_prepares_for_removal_and_completes_once_files_close() {
        let mut server = FileServer::new(FileServerConfig::default());
        server.prepare_volume_for_removal().unwrap();
        assert_eq!(server.volume_state(), VolumeState::PreparingForRemoval);
        let outcome = server.update(50);
        assert_eq!(server.volume_state(), VolumeState::Removed);
        assert!(outcome.outbound.iter().any(|(_, d)| d[0] == FSFunction::VolumeStatus as u8));
    }

    #[test]
    fn wildcard_matches_star_and_question_mark() {
        assert!(wildcard_match("FIELD01.TXT", "FIELD*.TXT"));
        assert!(wildcard_match("A.TXT", "?.TXT"));
        assert!(!wildcard_match("FIELD01.BIN", "FIELD*.TXT"));
    }
}
