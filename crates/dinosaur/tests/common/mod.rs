use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

/// Dockerfileと、子プロセス専用のTMPDIRを持つテスト環境
pub struct TestProject {
    pub root: TempDir,
    tmp: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn write_dockerfile(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// 子プロセスの一時ディレクトリ
    pub fn tmp_dir(&self) -> &Path {
        self.tmp.path()
    }

    /// 一時ディレクトリに残っているエントリ
    pub fn leftover_staging(&self) -> Vec<String> {
        fs::read_dir(self.tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }
}

/// Unixソケット上で `/_ping` と `/build` に固定レスポンスを返すフェイクデーモン
pub struct FakeDaemon {
    _dir: TempDir,
    socket: PathBuf,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeDaemon {
    pub fn start(build_body: &str) -> Self {
        Self::respond_with("200 OK", build_body)
    }

    /// `/build` を指定のステータスで拒否する（`/_ping` は成功させる）
    pub fn rejecting(status: &str, message: &str) -> Self {
        let body = format!("{{\"message\":\"{}\"}}", message);
        Self::respond_with(status, &body)
    }

    fn respond_with(build_status: &str, build_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let status = build_status.to_string();
        let body = build_body.to_string();
        let log = Arc::clone(&requests);
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut stream) = conn else { break };
                let request_line = read_request(&mut stream);
                let (response_status, response_body) = if request_line.contains("/_ping") {
                    ("200 OK", "OK")
                } else {
                    (status.as_str(), body.as_str())
                };
                log.lock().unwrap().push(request_line);

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response_status,
                    response_body.len(),
                    response_body
                );
                stream.write_all(response.as_bytes()).ok();
            }
        });

        Self {
            _dir: dir,
            socket,
            requests,
        }
    }

    pub fn host(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    /// 受信したリクエストライン
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn build_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.starts_with("POST "))
            .collect()
    }
}

/// ヘッダーとボディを読み、リクエストラインを返す
fn read_request(stream: &mut UnixStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            return String::new();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let mut received = buf.len() - head_end;
    while received < content_length {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            break;
        }
        received += n;
    }

    head.lines().next().unwrap_or_default().to_string()
}
