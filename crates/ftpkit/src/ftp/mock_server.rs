//! Scripted in-process FTP server for tests.
//!
//! Speaks enough RFC 959 for the client: login, PWD/CWD, TYPE,
//! PASV/EPSV/PORT/EPRT, LIST/NLST/STOR/RETR, MKD/RMD/DELE/RNFR/RNTO,
//! SIZE, NOOP, ABOR and QUIT. Behaviour is tuned through `MockState`.

use crate::ftp::types::{DataChannelMode, FtpConfig};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct MockState {
    pub banner: String,
    pub user: String,
    pub pass: String,
    pub cwd: String,
    pub files: HashMap<String, Vec<u8>>,
    /// LIST bodies keyed by the LIST argument ("" for no argument).
    pub listings: HashMap<String, String>,
    pub name_list: String,
    pub dirs: Vec<String>,
    /// Every command line received, in order.
    pub commands: Vec<String>,
    /// Immediate reply to STOR instead of 150.
    pub stor_reply: Option<String>,
    /// Final reply after STOR data instead of 226.
    pub stor_final_reply: Option<String>,
    /// Stop reading STOR data after this many bytes and close the socket.
    pub stor_accept_limit: Option<usize>,
    pub retr_chunk_size: usize,
    pub retr_chunk_delay: Option<Duration>,
    pub epsv_supported: bool,
    /// Host part of the 227 reply, e.g. "0,0,0,0".
    pub pasv_host: Option<String>,
    pub noop_reply: Option<String>,
    /// Verbs the server swallows without replying.
    pub silent_verbs: Vec<String>,
    /// Set once ABOR is received.
    pub aborted: bool,
    /// Set when a RETR write fails because the client closed the data socket.
    pub data_closed_by_client: bool,
    pub connections: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            banner: "220 Ready".into(),
            user: "user".into(),
            pass: "secret".into(),
            cwd: "/".into(),
            files: HashMap::new(),
            listings: HashMap::new(),
            name_list: String::new(),
            dirs: vec!["/".into()],
            commands: Vec::new(),
            stor_reply: None,
            stor_final_reply: None,
            stor_accept_limit: None,
            retr_chunk_size: 4096,
            retr_chunk_delay: None,
            epsv_supported: true,
            pasv_host: None,
            noop_reply: None,
            silent_verbs: Vec::new(),
            aborted: false,
            data_closed_by_client: false,
            connections: 0,
        }
    }
}

pub type SharedState = Arc<Mutex<MockState>>;

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: SharedState,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(state: MockState) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));
        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                tokio::spawn(handle_connection(stream, shared.clone()));
            }
        });
        MockServer { addr, state, task }
    }

    /// Client config pointing at this server, with short timeouts.
    pub fn config(&self) -> FtpConfig {
        let (user, pass) = {
            let s = self.state.lock().unwrap();
            (s.user.clone(), s.pass.clone())
        };
        let mut config = FtpConfig::new("127.0.0.1", user, pass);
        config.endpoint.port = self.addr.port();
        config.connect_timeout_sec = 5;
        config.command_timeout_sec = 5;
        config.data_timeout_sec = 5;
        config.keepalive_interval_sec = 0;
        config.data_channel_mode = DataChannelMode::Passive;
        config
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(verb))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum DataSource {
    Passive(TcpListener),
    Active(SocketAddr),
}

async fn open_data(source: DataSource) -> Option<TcpStream> {
    match source {
        DataSource::Passive(listener) => {
            match tokio::time::timeout(Duration::from_secs(5), listener.accept()).await {
                Ok(Ok((stream, _))) => Some(stream),
                _ => None,
            }
        }
        DataSource::Active(addr) => TcpStream::connect(addr).await.ok(),
    }
}

async fn reply(wr: &mut OwnedWriteHalf, line: &str) -> bool {
    wr.write_all(format!("{}\r\n", line).as_bytes()).await.is_ok()
}

fn path_arg(arg: &str, cwd: &str) -> String {
    if arg.starts_with('/') {
        arg.to_string()
    } else if cwd.ends_with('/') {
        format!("{}{}", cwd, arg)
    } else {
        format!("{}/{}", cwd, arg)
    }
}

async fn handle_connection(stream: TcpStream, state: SharedState) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let banner = state.lock().unwrap().banner.clone();
    if !reply(&mut wr, &banner).await {
        return;
    }

    let mut pending_user: Option<String> = None;
    let mut logged_in = false;
    let mut data_source: Option<DataSource> = None;
    let mut rename_from: Option<String> = None;
    let (done_tx, mut done_rx) = mpsc::channel::<String>(4);
    let mut transfer_abort: Option<Arc<AtomicBool>> = None;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(l)) => l,
                _ => break,
            },
            Some(final_reply) = done_rx.recv() => {
                transfer_abort = None;
                if !reply(&mut wr, &final_reply).await {
                    break;
                }
                continue;
            }
        };

        state.lock().unwrap().commands.push(line.clone());
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_uppercase(), a.to_string()),
            None => (line.trim().to_uppercase(), String::new()),
        };

        if state.lock().unwrap().silent_verbs.contains(&verb) {
            continue;
        }

        if !logged_in && !matches!(verb.as_str(), "USER" | "PASS" | "QUIT" | "ABOR") {
            reply(&mut wr, "530 Please login with USER and PASS").await;
            continue;
        }

        let cwd = state.lock().unwrap().cwd.clone();
        let response: Option<String> = match verb.as_str() {
            "USER" => {
                pending_user = Some(arg);
                Some("331 Password required".into())
            }
            "PASS" => {
                let ok = {
                    let s = state.lock().unwrap();
                    pending_user.as_deref() == Some(s.user.as_str()) && arg == s.pass
                };
                if ok {
                    logged_in = true;
                    Some("230 Logged in".into())
                } else {
                    Some("530 Login incorrect".into())
                }
            }
            "SYST" => Some("215 UNIX Type: L8".into()),
            "PWD" => Some(format!("257 \"{}\" is the current directory", cwd)),
            "CWD" => {
                let target = path_arg(&arg, &cwd);
                let mut s = state.lock().unwrap();
                if s.dirs.contains(&target) {
                    s.cwd = target;
                    Some("250 Directory changed".into())
                } else {
                    Some("550 No such directory".into())
                }
            }
            "CDUP" => {
                let mut s = state.lock().unwrap();
                let parent = match s.cwd.rfind('/') {
                    Some(0) | None => "/".to_string(),
                    Some(i) => s.cwd[..i].to_string(),
                };
                s.cwd = parent;
                Some("250 Directory changed".into())
            }
            "TYPE" => Some(format!("200 Type set to {}", arg)),
            "NOOP" => {
                let custom = state.lock().unwrap().noop_reply.clone();
                match custom {
                    Some(r) if r.starts_with("421") => {
                        reply(&mut wr, &r).await;
                        break;
                    }
                    Some(r) => Some(r),
                    None => Some("200 NOOP ok".into()),
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_source = Some(DataSource::Passive(listener));
                let host = state
                    .lock()
                    .unwrap()
                    .pasv_host
                    .clone()
                    .unwrap_or_else(|| "127,0,0,1".into());
                Some(format!(
                    "227 Entering Passive Mode ({},{},{})",
                    host,
                    port >> 8,
                    port & 0xff
                ))
            }
            "EPSV" => {
                if state.lock().unwrap().epsv_supported {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    data_source = Some(DataSource::Passive(listener));
                    Some(format!("229 Entering Extended Passive Mode (|||{}|)", port))
                } else {
                    Some("502 EPSV not implemented".into())
                }
            }
            "PORT" => {
                let nums: Vec<u16> = arg.split(',').filter_map(|n| n.trim().parse().ok()).collect();
                if nums.len() == 6 {
                    let ip = IpAddr::from([nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8]);
                    data_source = Some(DataSource::Active(SocketAddr::new(ip, nums[4] * 256 + nums[5])));
                    Some("200 PORT command successful".into())
                } else {
                    Some("501 Bad PORT".into())
                }
            }
            "EPRT" => {
                let parts: Vec<&str> = arg.split('|').collect();
                match (parts.get(2).and_then(|ip| ip.parse::<IpAddr>().ok()), parts.get(3).and_then(|p| p.parse::<u16>().ok())) {
                    (Some(ip), Some(port)) => {
                        data_source = Some(DataSource::Active(SocketAddr::new(ip, port)));
                        Some("200 EPRT command successful".into())
                    }
                    _ => Some("501 Bad EPRT".into()),
                }
            }
            "LIST" | "NLST" => {
                let body = {
                    let s = state.lock().unwrap();
                    if verb == "NLST" {
                        Some(s.name_list.clone())
                    } else {
                        s.listings.get(&arg).cloned()
                    }
                };
                match (body, data_source.take()) {
                    (None, _) => Some("550 No such directory".into()),
                    (Some(_), None) => Some("425 Use PORT or PASV first".into()),
                    (Some(body), Some(source)) => {
                        let tx = done_tx.clone();
                        tokio::spawn(async move {
                            match open_data(source).await {
                                Some(mut data) => {
                                    let _ = data.write_all(body.as_bytes()).await;
                                    let _ = data.shutdown().await;
                                    let _ = tx.send("226 Transfer complete".into()).await;
                                }
                                None => {
                                    let _ = tx.send("425 Can't open data connection".into()).await;
                                }
                            }
                        });
                        Some("150 Here comes the directory listing".into())
                    }
                }
            }
            "STOR" => {
                let target = path_arg(&arg, &cwd);
                let (immediate, final_reply, limit) = {
                    let s = state.lock().unwrap();
                    (s.stor_reply.clone(), s.stor_final_reply.clone(), s.stor_accept_limit)
                };
                if let Some(r) = immediate {
                    data_source = None;
                    Some(r)
                } else if let Some(source) = data_source.take() {
                    let tx = done_tx.clone();
                    let shared = state.clone();
                    tokio::spawn(async move {
                        let Some(mut data) = open_data(source).await else {
                            let _ = tx.send("425 Can't open data connection".into()).await;
                            return;
                        };
                        let mut received = Vec::new();
                        match limit {
                            Some(limit) => {
                                let mut buf = vec![0u8; limit];
                                let _ = data.read_exact(&mut buf).await;
                                received.extend_from_slice(&buf);
                                drop(data);
                                let _ = tx.send(final_reply.unwrap_or_else(|| "552 Quota exceeded".into())).await;
                            }
                            None => {
                                let _ = data.read_to_end(&mut received).await;
                                shared.lock().unwrap().files.insert(target, received);
                                let _ = tx.send(final_reply.unwrap_or_else(|| "226 Transfer complete".into())).await;
                            }
                        }
                    });
                    Some("150 Ok to send data".into())
                } else {
                    Some("425 Use PORT or PASV first".into())
                }
            }
            "RETR" => {
                let target = path_arg(&arg, &cwd);
                let (content, chunk, delay) = {
                    let s = state.lock().unwrap();
                    (s.files.get(&target).cloned(), s.retr_chunk_size.max(1), s.retr_chunk_delay)
                };
                match (content, data_source.take()) {
                    (None, _) => Some("550 File not found".into()),
                    (Some(_), None) => Some("425 Use PORT or PASV first".into()),
                    (Some(content), Some(source)) => {
                        let tx = done_tx.clone();
                        let abort = Arc::new(AtomicBool::new(false));
                        transfer_abort = Some(abort.clone());
                        let shared = state.clone();
                        tokio::spawn(async move {
                            let Some(mut data) = open_data(source).await else {
                                let _ = tx.send("425 Can't open data connection".into()).await;
                                return;
                            };
                            // ABOR alone does not stop the writer; only a failed
                            // write does, so a client that never closes its end of
                            // the data channel shows up as a completed transfer.
                            for piece in content.chunks(chunk) {
                                if data.write_all(piece).await.is_err() {
                                    shared.lock().unwrap().data_closed_by_client = true;
                                    let reply = if abort.load(Ordering::SeqCst) {
                                        "426 Transfer aborted"
                                    } else {
                                        "426 Connection closed; transfer aborted"
                                    };
                                    let _ = tx.send(reply.into()).await;
                                    return;
                                }
                                if let Some(d) = delay {
                                    tokio::time::sleep(d).await;
                                }
                            }
                            let _ = data.shutdown().await;
                            let _ = tx.send("226 Transfer complete".into()).await;
                        });
                        Some("150 Opening BINARY mode data connection".into())
                    }
                }
            }
            "ABOR" => {
                state.lock().unwrap().aborted = true;
                match transfer_abort.take() {
                    Some(flag) => {
                        flag.store(true, Ordering::SeqCst);
                        if let Some(final_reply) = done_rx.recv().await {
                            reply(&mut wr, &final_reply).await;
                        }
                        Some("226 ABOR command successful".into())
                    }
                    None => Some("225 No transfer to abort".into()),
                }
            }
            "SIZE" => {
                let target = path_arg(&arg, &cwd);
                match state.lock().unwrap().files.get(&target) {
                    Some(c) => Some(format!("213 {}", c.len())),
                    None => Some("550 Could not get file size".into()),
                }
            }
            "MKD" => {
                let target = path_arg(&arg, &cwd);
                let mut s = state.lock().unwrap();
                if s.dirs.contains(&target) {
                    Some("550 Directory already exists".into())
                } else {
                    s.dirs.push(target.clone());
                    Some(format!("257 \"{}\" created", target))
                }
            }
            "RMD" => {
                let target = path_arg(&arg, &cwd);
                let mut s = state.lock().unwrap();
                match s.dirs.iter().position(|d| *d == target) {
                    Some(i) => {
                        s.dirs.remove(i);
                        Some("250 Directory removed".into())
                    }
                    None => Some("550 No such directory".into()),
                }
            }
            "DELE" => {
                let target = path_arg(&arg, &cwd);
                match state.lock().unwrap().files.remove(&target) {
                    Some(_) => Some("250 File deleted".into()),
                    None => Some("550 No such file".into()),
                }
            }
            "RNFR" => {
                let target = path_arg(&arg, &cwd);
                if state.lock().unwrap().files.contains_key(&target) {
                    rename_from = Some(target);
                    Some("350 Ready for RNTO".into())
                } else {
                    Some("550 No such file".into())
                }
            }
            "RNTO" => match rename_from.take() {
                Some(from) => {
                    let target = path_arg(&arg, &cwd);
                    let mut s = state.lock().unwrap();
                    if let Some(content) = s.files.remove(&from) {
                        s.files.insert(target, content);
                    }
                    Some("250 Rename successful".into())
                }
                None => Some("503 RNFR required first".into()),
            },
            "QUIT" => {
                reply(&mut wr, "221 Goodbye").await;
                break;
            }
            _ => Some("502 Command not implemented".into()),
        };

        if let Some(r) = response {
            if !reply(&mut wr, &r).await {
                break;
            }
        }
    }
}
