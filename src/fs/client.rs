//! ISO 11783-13 file client: connects to a file server, tracks open files, retries nothing.
//!
//! Unlike the server, which can answer synchronously within [`handle_message`], the client's
//! requests complete asynchronously over the bus. Callers submit a request (which allocates a
//! TAN and queues an outbound frame) and later receive a [`FsCompletion`] once the matching
//! response arrives via [`handle_message`] or the request times out via [`update`].

use std::collections::HashMap;

use crate::event::Event;
use crate::fs::error_codes::{FSError, OpenFlags};
use crate::fs::types::{CcmMessage, FSFunction, FileHandle, FileServerProperties, FileServerStatus, Tan, INVALID_FILE_HANDLE, INVALID_TAN};
use crate::network::Message;
use crate::types::{Address, Result, NULL_ADDRESS};

pub const PGN_FILE_CLIENT_TO_SERVER: u32 = 0xAA00;
pub const PGN_FILE_SERVER_TO_CLIENT: u32 = 0xAB00;

const STATUS_TAN: Tan = 0xFF;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    WaitingForStatus,
    Connected,
}

struct OpenFileInfo {
    path: String,
    flags: OpenFlags,
    position: u32,
}

struct PendingRequest {
    function: FSFunction,
    timestamp_ms: u32,
}

/// What completed, surfaced once a response frame for a previously sent TAN arrives.
#[derive(Debug, Clone)]
pub enum FsCompletion {
    Connected,
    OpenFile { handle: Result<FileHandle, FSError> },
    CloseFile { handle: FileHandle },
    ReadFile { data: Result<Vec<u8>, FSError> },
    WriteFile { written: Result<u8, FSError> },
    SeekFile { result: Result<(), FSError> },
    CurrentDirectory { path: Result<String, FSError> },
    ChangeDirectory { result: Result<(), FSError> },
    RequestTimedOut { function: FSFunction },
}

#[derive(Debug, Clone, Copy)]
pub struct FileClientConfig {
    pub ccm_interval_ms: u32,
    pub request_timeout_ms: u32,
    pub server_status_timeout_ms: u32,
}

impl Default for FileClientConfig {
    fn default() -> Self {
        Self {
            ccm_interval_ms: CcmMessage::INTERVAL_MS,
            request_timeout_ms: 6000,
            server_status_timeout_ms: 6000,
        }
    }
}

/// Client-side half of an ISO 11783-13 file transfer session.
pub struct FileClient {
    config: FileClientConfig,
    server_address: Address,
    state: ClientState,
    ccm_timer_ms: u32,
    server_status_timer_ms: u32,
    now_ms: u32,
    next_tan: Tan,
    pending_requests: HashMap<Tan, PendingRequest>,
    server_properties: Option<FileServerProperties>,
    server_status: Option<FileServerStatus>,
    open_files: HashMap<FileHandle, OpenFileInfo>,
    current_directory: String,

    pub on_connected: Event<()>,
    pub on_disconnected: Event<()>,
    pub on_error: Event<FSError>,
}

/// Outbound frames and surfaced completions produced by handling a message or a tick.
#[derive(Debug, Default)]
pub struct FsClientOutcome {
    pub outbound: Vec<Vec<u8>>,
    pub completions: Vec<FsCompletion>,
}

impl FileClient {
    pub fn new(config: FileClientConfig) -> Self {
        Self {
            config,
            server_address: NULL_ADDRESS,
            state: ClientState::Disconnected,
            ccm_timer_ms: 0,
            server_status_timer_ms: 0,
            now_ms: 0,
            next_tan: 0,
            pending_requests: HashMap::new(),
            server_properties: None,
            server_status: None,
            open_files: HashMap::new(),
            current_directory: "\\".to_string(),
            on_connected: Event::new(),
            on_disconnected: Event::new(),
            on_error: Event::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn server_properties(&self) -> Option<&FileServerProperties> {
        self.server_properties.as_ref()
    }

    pub fn server_status(&self) -> Option<&FileServerStatus> {
        self.server_status.as_ref()
    }

    /// Begin connecting; queues a server-properties request whose success promotes the client
    /// to [`ClientState::Connected`].
    pub fn connect_to_server(&mut self, server: Address) -> Result<Vec<u8>> {
        if self.state != ClientState::Disconnected {
            return Err(crate::error::IsobusError::InvalidState(
                "already connecting or connected".into(),
            ));
        }
        self.server_address = server;
        self.state = ClientState::WaitingForStatus;
        self.ccm_timer_ms = 0;
        self.server_status_timer_ms = 0;
        Ok(self.request_server_properties())
    }

    pub fn disconnect(&mut self) {
        self.state = ClientState::Disconnected;
        self.server_address = NULL_ADDRESS;
        self.pending_requests.clear();
        self.open_files.clear();
        self.current_directory = "\\".to_string();
        self.on_disconnected.emit(());
    }

    pub fn request_server_properties(&mut self) -> Vec<u8> {
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::GetFileServerProperties);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::GetFileServerProperties as u8;
        request[1] = tan;
        request.to_vec()
    }

    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(crate::error::IsobusError::InvalidState("not connected".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::OpenFile);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::OpenFile as u8;
        request[1] = tan;
        request[2] = path.len() as u8;
        request[3] = flags.bits();
        for (i, b) in path.bytes().take(4).enumerate() {
            request[4 + i] = b;
        }
        Ok(request.to_vec())
    }

    pub fn close_file(&mut self, handle: FileHandle) -> Result<Vec<u8>> {
        if !self.open_files.contains_key(&handle) {
            return Err(crate::error::IsobusError::InvalidArgument("unknown file handle".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::CloseFile);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::CloseFile as u8;
        request[1] = tan;
        request[2] = handle;
        Ok(request.to_vec())
    }

    pub fn read_file(&mut self, handle: FileHandle, count: u8) -> Result<Vec<u8>> {
        if !self.open_files.contains_key(&handle) {
            return Err(crate::error::IsobusError::InvalidArgument("unknown file handle".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::ReadFile);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::ReadFile as u8;
        request[1] = tan;
        request[2] = handle;
        request[3] = count;
        Ok(request.to_vec())
    }

    pub fn write_file(&mut self, handle: FileHandle, data: &[u8]) -> Result<Vec<u8>> {
        if !self.open_files.contains_key(&handle) {
            return Err(crate::error::IsobusError::InvalidArgument("unknown file handle".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::WriteFile);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::WriteFile as u8;
        request[1] = tan;
        request[2] = handle;
        request[3] = data.len() as u8;
        for (i, &b) in data.iter().take(4).enumerate() {
            request[4 + i] = b;
        }
        Ok(request.to_vec())
    }

    pub fn seek_file(&mut self, handle: FileHandle, position: u32) -> Result<Vec<u8>> {
        if !self.open_files.contains_key(&handle) {
            return Err(crate::error::IsobusError::InvalidArgument("unknown file handle".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::SeekFile);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::SeekFile as u8;
        request[1] = tan;
        request[2] = handle;
        request[3..7].copy_from_slice(&position.to_le_bytes());
        Ok(request.to_vec())
    }

    pub fn change_directory(&mut self, path: &str) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(crate::error::IsobusError::InvalidState("not connected".into()));
        }
        let tan = self.allocate_tan();
        self.track(tan, FSFunction::ChangeDirectory);
        let mut request = [0xFFu8; 8];
        request[0] = FSFunction::ChangeDirectory as u8;
        request[1] = tan;
        request[2] = path.len() as u8;
        for (i, b) in path.bytes().take(4).enumerate() {
            request[3 + i] = b;
        }
        Ok(request.to_vec())
    }

    fn allocate_tan(&mut self) -> Tan {
        let tan = self.next_tan;
        self.next_tan = self.next_tan.wrapping_add(1);
        if self.next_tan == INVALID_TAN {
            self.next_tan = 0;
        }
        tan
    }

    fn track(&mut self, tan: Tan, function: FSFunction) {
        self.pending_requests.insert(
            tan,
            PendingRequest {
                function,
                timestamp_ms: self.now_ms,
            },
        );
    }

    /// Handle one inbound server-to-client frame.
    pub fn handle_message(&mut self, msg: &Message) -> FsClientOutcome {
        let mut outcome = FsClientOutcome::default();
        if msg.pgn != PGN_FILE_SERVER_TO_CLIENT || msg.payload.len() < 2 {
            return outcome;
        }
        if self.server_address != NULL_ADDRESS && msg.source != self.server_address {
            return outcome;
        }
        self.server_status_timer_ms = 0;
        let tan = msg.payload[1];
        if tan == STATUS_TAN {
            self.handle_status_broadcast(&msg.payload);
            return outcome;
        }
        let Some(pending) = self.pending_requests.remove(&tan) else {
            return outcome;
        };
        if let Some(completion) = self.dispatch_response(pending.function, &msg.payload) {
            outcome.completions.push(completion);
        }
        outcome
    }

    fn handle_status_broadcast(&mut self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        if data[0] == FSFunction::FileServerStatus as u8 {
            self.server_status = Some(FileServerStatus::decode(data));
        }
    }

    fn dispatch_response(&mut self, function: FSFunction, response: &[u8]) -> Option<FsCompletion> {
        match function {
            FSFunction::GetFileServerProperties => self.handle_properties_response(response),
            FSFunction::OpenFile => Some(self.handle_open_response(response)),
            FSFunction::CloseFile => Some(self.handle_close_response(response)),
            FSFunction::ReadFile => Some(self.handle_read_response(response)),
            FSFunction::WriteFile => Some(self.handle_write_response(response)),
            FSFunction::SeekFile => Some(self.handle_seek_response(response)),
            FSFunction::GetCurrentDirectory => Some(self.handle_get_directory_response(response)),
            FSFunction::ChangeDirectory => Some(self.handle_change_directory_response(response)),
            _ => None,
        }
    }

    fn handle_properties_response(&mut self, response: &[u8]) -> Option<FsCompletion> {
        if response.len() < 3 || response[2] != FSError::Success as u8 {
            return None;
        }
        self.server_properties = Some(FileServerProperties::decode(&response[3..]));
        if self.state == ClientState::WaitingForStatus {
            self.state = ClientState::Connected;
            self.on_connected.emit(());
            return Some(FsCompletion::Connected);
        }
        None
    }

    fn handle_open_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 4 {
            return FsCompletion::OpenFile {
                handle: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            self.on_error.emit(error);
            return FsCompletion::OpenFile { handle: Err(error) };
        }
        let handle = response[3];
        self.open_files.insert(
            handle,
            OpenFileInfo {
                path: String::new(),
                flags: OpenFlags::READ,
                position: 0,
            },
        );
        FsCompletion::OpenFile { handle: Ok(handle) }
    }

    fn handle_close_response(&mut self, response: &[u8]) -> FsCompletion {
        let handle = if response.len() > 3 { response[3] } else { INVALID_FILE_HANDLE };
        self.open_files.remove(&handle);
        FsCompletion::CloseFile { handle }
    }

    fn handle_read_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 4 {
            return FsCompletion::ReadFile {
                data: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            if error != FSError::Eof {
                self.on_error.emit(error);
            }
            return FsCompletion::ReadFile {
                data: if error == FSError::Eof { Ok(Vec::new()) } else { Err(error) },
            };
        }
        let count = response[3] as usize;
        let data: Vec<u8> = response[4..].iter().copied().take(count).collect();
        FsCompletion::ReadFile { data: Ok(data) }
    }

    fn handle_write_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 4 {
            return FsCompletion::WriteFile {
                written: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            self.on_error.emit(error);
            return FsCompletion::WriteFile { written: Err(error) };
        }
        FsCompletion::WriteFile {
            written: Ok(response[3]),
        }
    }

    fn handle_seek_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 3 {
            return FsCompletion::SeekFile {
                result: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            self.on_error.emit(error);
            return FsCompletion::SeekFile { result: Err(error) };
        }
        FsCompletion::SeekFile { result: Ok(()) }
    }

    fn handle_get_directory_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 4 {
            return FsCompletion::CurrentDirectory {
                path: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            return FsCompletion::CurrentDirectory { path: Err(error) };
        }
        let path_len = response[3] as usize;
        let path = String::from_utf8_lossy(&response[4..(4 + path_len).min(response.len())]).into_owned();
        self.current_directory = path.clone();
        FsCompletion::CurrentDirectory { path: Ok(path) }
    }

    fn handle_change_directory_response(&mut self, response: &[u8]) -> FsCompletion {
        if response.len() < 3 {
            return FsCompletion::ChangeDirectory {
                result: Err(FSError::MalformedRequest),
            };
        }
        let error = FSError::from_code(response[2]);
        if error != FSError::Success {
            self.on_error.emit(error);
            return FsCompletion::ChangeDirectory { result: Err(error) };
        }
        FsCompletion::ChangeDirectory { result: Ok(()) }
    }

    /// Advance timers, sending a CCM heartbeat when connected and surfacing timed-out requests.
    /// No retry is attempted at this layer; the caller decides whether to re-issue a request.
    pub fn update(&mut self, elapsed_ms: u32) -> FsClientOutcome {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);
        let mut outcome = FsClientOutcome::default();

        if self.is_connected() {
            self.ccm_timer_ms += elapsed_ms;
            if self.ccm_timer_ms >= self.config.ccm_interval_ms {
                self.ccm_timer_ms = 0;
                outcome.outbound.push(self.build_ccm());
            }
        }

        if matches!(self.state, ClientState::WaitingForStatus | ClientState::Connected) {
            self.server_status_timer_ms += elapsed_ms;
            if self.server_status_timer_ms >= self.config.server_status_timeout_ms {
                self.disconnect();
                return outcome;
            }
        }

        let now_ms = self.now_ms;
        let timeout_ms = self.config.request_timeout_ms;
        let expired: Vec<(Tan, FSFunction)> = self
            .pending_requests
            .iter()
            .filter(|(_, req)| now_ms.wrapping_sub(req.timestamp_ms) > timeout_ms)
            .map(|(&tan, req)| (tan, req.function))
            .collect();
        for (tan, function) in expired {
            self.pending_requests.remove(&tan);
            outcome.completions.push(FsCompletion::RequestTimedOut { function });
        }
        outcome
    }

    fn build_ccm(&mut self) -> Vec<u8> {
        let tan = self.allocate_tan();
        let mut data = CcmMessage { version: 1, tan }.encode();
        data[0] = 0xFF;
        data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_response(tan: Tan, payload: Vec<u8>) -> Message {
        Message {
            pgn: PGN_FILE_SERVER_TO_CLIENT,
            priority: 6,
            source: 0x10,
            destination: 0x20,
            payload: {
                let mut p = vec![payload[0], tan];
                p.extend_from_slice(&payload[2..]);
                p
            },
            timestamp: 0,
        }
    }

    #[test]
    fn connect_transitions_to_connected_on_properties_response() {
        let mut client = FileClient::new(FileClientConfig::default());
        client.connect_to_server(0x10).unwrap();
        assert_eq!(client.state(), ClientState::WaitingForStatus);

        let mut props = [0xFFu8; 8];
        props[0] = FSFunction::GetFileServerProperties as u8;
        props[2] = FSError::Success as u8;
        let msg = server_response(0, props.to_vec());
        let outcome = client.handle_message(&msg);
        assert!(client.is_connected());
        assert!(matches!(outcome.completions[0], FsCompletion::Connected));
    }

    #[test]
    fn open_file_failure_is_surfaced_without_tracking_handle() {
        let mut client = FileClient::new(FileClientConfig::default());
        client.connect_to_server(0x10).unwrap();
        let props_msg = server_response(0, {
            let mut p = [0xFFu8; 8];
            p[0] = FSFunction::GetFileServerProperties as u8;
            p[2] = FSError::Success as u8;
            p.to_vec()
        });
        client.handle_message(&props_msg);

        client.open_file("MISSING.TXT", OpenFlags::READ).unwrap();
        let mut resp = [0xFFu8; 8];
        resp[0] = FSFunction::OpenFile as u8;
        resp[2] = FSError::NotFound as u8;
        let msg = server_response(1, resp.to_vec());
        let outcome = client.handle_message(&msg);
        match &outcome.completions[0] {
            FsCompletion::OpenFile { handle } => assert_eq!(*handle, Err(FSError::NotFound)),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn request_without_response_times_out() {
        let mut client = FileClient::new(FileClientConfig {
            request_timeout_ms: 100,
            ..Default::default()
        });
        client.connect_to_server(0x10).unwrap();
        let outcome = client.update(150);
        assert!(outcome
            .completions
            .iter()
            .any(|c| matches!(c, FsCompletion::RequestTimedOut { .. })));
    }
}
