//! Embedding provider backed by a long-lived helper process.
//!
//! The helper owns the face model. Each request is one JSON header line
//! followed by `width * height` raw luma bytes on the helper's stdin; the
//! helper answers with exactly one JSON line on stdout:
//!
//! ```text
//! → {"op":"locate","width":640,"height":480}\n<307200 bytes>
//! ← {"boxes":[{"x":..,"y":..,"width":..,"height":..,"confidence":..}]}
//! → {"op":"encode","width":640,"height":480,"boxes":[..]}\n<307200 bytes>
//! ← {"embeddings":[[..128 floats..]]}
//! ← {"error":"reason"}
//! ```

use faceward_core::{BoundingBox, Embedding, EmbeddingProvider, ProviderError};
use faceward_hw::Frame;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, PoisonError};

#[derive(Serialize)]
struct Request<'a> {
    op: &'static str,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    boxes: Option<&'a [BoundingBox]>,
}

#[derive(Debug, Deserialize, Default)]
struct Response {
    #[serde(default)]
    boxes: Option<Vec<BoundingBox>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    error: Option<String>,
}

struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for Helper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns the helper on first use and respawns it after it dies.
///
/// Requests are serialized over the single pipe pair.
pub struct SidecarProvider {
    program: String,
    args: Vec<String>,
    helper: Mutex<Option<Helper>>,
}

impl SidecarProvider {
    /// `command_line` is split on whitespace: program followed by arguments.
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            helper: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Helper, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("{}: {e}", self.program)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ProviderError::Unavailable(format!(
                "{}: helper pipes not available",
                self.program
            )));
        };
        tracing::info!(program = %self.program, pid = child.id(), "embedding helper started");
        Ok(Helper {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn request(&self, request: &Request<'_>, frame: &Frame) -> Result<Response, ProviderError> {
        let mut slot = self.helper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.spawn()?);
        }
        let Some(helper) = slot.as_mut() else {
            return Err(ProviderError::Unavailable(self.program.clone()));
        };

        let result = exchange(&mut helper.stdin, &mut helper.stdout, request, &frame.data);
        if matches!(result, Err(ProviderError::Io(_)) | Err(ProviderError::Unavailable(_))) {
            // The pipe is in an unknown state; start over on the next request.
            tracing::warn!(program = %self.program, "embedding helper lost; will respawn");
            *slot = None;
        }
        result
    }
}

impl EmbeddingProvider for SidecarProvider {
    fn locate_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
        let request = Request {
            op: "locate",
            width: frame.width,
            height: frame.height,
            boxes: None,
        };
        self.request(&request, frame)?
            .boxes
            .ok_or_else(|| ProviderError::Protocol("locate response without boxes".into()))
    }

    fn encode_faces(
        &self,
        frame: &Frame,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError> {
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let request = Request {
            op: "encode",
            width: frame.width,
            height: frame.height,
            boxes: Some(boxes),
        };
        let embeddings = self
            .request(&request, frame)?
            .embeddings
            .ok_or_else(|| ProviderError::Protocol("encode response without embeddings".into()))?;
        if embeddings.len() != boxes.len() {
            return Err(ProviderError::Protocol(format!(
                "asked for {} embeddings, got {}",
                boxes.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings.into_iter().map(Embedding::from).collect())
    }
}

/// One request/response round trip over an already-open pipe pair.
fn exchange(
    writer: &mut impl Write,
    reader: &mut impl BufRead,
    request: &Request<'_>,
    pixels: &[u8],
) -> Result<Response, ProviderError> {
    let mut header = serde_json::to_vec(request)
        .map_err(|e| ProviderError::Protocol(format!("encode request: {e}")))?;
    header.push(b'\n');
    writer.write_all(&header)?;
    writer.write_all(pixels)?;
    writer.flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ProviderError::Unavailable("helper closed its output".into()));
    }
    let response: Response = serde_json::from_str(line.trim_end())
        .map_err(|e| ProviderError::Protocol(format!("bad response line: {e}")))?;
    match response.error {
        Some(reason) => Err(ProviderError::Remote(reason)),
        None => Ok(response),
    }
}
