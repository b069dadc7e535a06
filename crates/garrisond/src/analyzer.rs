//! Face-analysis sidecar client.
//!
//! Face detection, embedding and 68-point landmark location run in an
//! external helper process. The daemon talks to it over stdin/stdout:
//!
//! ```text
//! → {"op":"analyze","width":640,"height":480,"len":921600}\n<len raw BGR bytes>
//! ← {"faces":[{"region":{"x":..,"y":..,"width":..,"height":..},"embedding":{"values":[..]}}]}\n
//! → {"op":"landmarks",...}\n<bytes>
//! ← {"landmarks":[{"left_eye":[{"x":..,"y":..},..],"right_eye":[..]}]}\n
//! ← {"error":"..."}\n   (frame rejected, stream stays in sync)
//! ```
//!
//! The process is spawned lazily and respawned on the next request after
//! any I/O or protocol failure.

use garrison_core::{
    AnalyzerError, BgrImage, FaceAnalyzer, FaceLandmarks, FaceObservation, LandmarkLocator,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    Analyze,
    Landmarks,
}

#[derive(Serialize)]
struct RequestHeader {
    op: Op,
    width: u32,
    height: u32,
    len: usize,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    faces: Option<Vec<FaceObservation>>,
    #[serde(default)]
    landmarks: Option<Vec<FaceLandmarks>>,
    #[serde(default)]
    error: Option<String>,
}

fn write_request<W: Write>(w: &mut W, op: Op, frame: &BgrImage) -> Result<(), AnalyzerError> {
    let header = RequestHeader {
        op,
        width: frame.width(),
        height: frame.height(),
        len: frame.data().len(),
    };
    let line = serde_json::to_string(&header)
        .map_err(|e| AnalyzerError::Protocol(format!("encode request: {e}")))?;
    w.write_all(line.as_bytes())?;
    w.write_all(b"\n")?;
    w.write_all(frame.data())?;
    w.flush()?;
    Ok(())
}

fn read_reply<R: BufRead>(r: &mut R) -> Result<Reply, AnalyzerError> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(AnalyzerError::Unavailable("sidecar closed its output".into()));
    }
    let reply: Reply = serde_json::from_str(line.trim_end())
        .map_err(|e| AnalyzerError::Protocol(format!("malformed reply: {e}")))?;
    if let Some(error) = reply.error {
        return Err(AnalyzerError::Rejected(error));
    }
    Ok(reply)
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Connection to the analysis sidecar.
pub struct Sidecar {
    command: Vec<String>,
    process: Option<Process>,
}

impl Sidecar {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            process: None,
        }
    }

    fn spawn(&self) -> Result<Process, AnalyzerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AnalyzerError::Unavailable("no analyzer command configured".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| AnalyzerError::Unavailable(format!("cannot start {program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(AnalyzerError::Unavailable("sidecar pipes unavailable".into()));
        };
        tracing::info!(program = %program, pid = child.id(), "analysis sidecar started");
        Ok(Process {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn request(&mut self, op: Op, frame: &BgrImage) -> Result<Reply, AnalyzerError> {
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(AnalyzerError::Unavailable("sidecar not running".into()));
        };

        let result = write_request(&mut process.stdin, op, frame)
            .and_then(|()| read_reply(&mut process.stdout));
        match result {
            // A reported rejection leaves the stream in sync.
            Err(AnalyzerError::Rejected(msg)) => Err(AnalyzerError::Rejected(msg)),
            Err(e) => {
                tracing::warn!(error = %e, "analysis sidecar failed; restarting on next frame");
                self.process = None;
                Err(e)
            }
            ok => ok,
        }
    }
}

impl FaceAnalyzer for Sidecar {
    fn analyze(&mut self, frame: &BgrImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        Ok(self.request(Op::Analyze, frame)?.faces.unwrap_or_default())
    }
}

impl LandmarkLocator for Sidecar {
    fn locate(&mut self, frame: &BgrImage) -> Result<Vec<FaceLandmarks>, AnalyzerError> {
        Ok(self.request(Op::Landmarks, frame)?.landmarks.unwrap_or_default())
    }
}

/// One sidecar serving both the analyzer and landmark roles of a thread.
#[derive(Clone)]
pub struct SharedSidecar(Rc<RefCell<Sidecar>>);

impl SharedSidecar {
    pub fn new(sidecar: Sidecar) -> Self {
        Self(Rc::new(RefCell::new(sidecar)))
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut Sidecar) -> Result<T, AnalyzerError>,
    ) -> Result<T, AnalyzerError> {
        let mut sidecar = self
            .0
            .try_borrow_mut()
            .map_err(|_| AnalyzerError::Unavailable("sidecar busy".into()))?;
        f(&mut sidecar)
    }
}

impl FaceAnalyzer for SharedSidecar {
    fn analyze(&mut self, frame: &BgrImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        self.with(|s| s.analyze(frame))
    }
}

impl LandmarkLocator for SharedSidecar {
    fn locate(&mut self, frame: &BgrImage) -> Result<Vec<FaceLandmarks>, AnalyzerError> {
        self.with(|s| s.locate(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_framing() {
        let frame = BgrImage::filled(2, 1, [1, 2, 3]);
        let mut out = Vec::new();
        write_request(&mut out, Op::Landmarks, &frame).unwrap();

        let newline = out.iter().position(|&b| b == b'\n').unwrap();
        let header: serde_json::Value = serde_json::from_slice(&out[..newline]).unwrap();
        assert_eq!(header["op"], "landmarks");
        assert_eq!(header["width"], 2);
        assert_eq!(header["len"], 6);
        assert_eq!(&out[newline + 1..], &[1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_read_faces_reply() {
        let mut input = Cursor::new(
            br#"{"faces":[{"region":{"x":1.0,"y":2.0,"width":30.0,"height":40.0},"embedding":{"values":[0.1,0.2]}}]}
"#
            .to_vec(),
        );
        let reply = read_reply(&mut input).unwrap();
        let faces = reply.faces.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].region.width, 30.0);
        assert_eq!(faces[0].embedding.values, vec![0.1, 0.2]);
    }

    #[test]
    fn test_read_error_reply() {
        let mut input = Cursor::new(b"{\"error\":\"model not loaded\"}\n".to_vec());
        let err = read_reply(&mut input).unwrap_err();
        assert!(matches!(err, AnalyzerError::Rejected(ref m) if m == "model not loaded"));
    }

    #[test]
    fn test_read_eof_is_unavailable() {
        let mut input = Cursor::new(Vec::new());
        assert!(matches!(read_reply(&mut input), Err(AnalyzerError::Unavailable(_))));
    }

    #[test]
    fn test_read_garbage_is_protocol_error() {
        let mut input = Cursor::new(b"not json\n".to_vec());
        assert!(matches!(read_reply(&mut input), Err(AnalyzerError::Protocol(_))));
    }

    #[test]
    fn test_missing_command_is_unavailable() {
        let mut sidecar = Sidecar::new(Vec::new());
        let result = sidecar.analyze(&BgrImage::filled(2, 2, [1, 1, 1]));
        assert!(matches!(result, Err(AnalyzerError::Unavailable(_))));
    }

    #[test]
    fn test_shared_sidecar_serves_both_roles() {
        let shared = SharedSidecar::new(Sidecar::new(Vec::new()));
        let mut faces = shared.clone();
        let mut landmarks = shared;
        let frame = BgrImage::filled(2, 2, [1, 1, 1]);
        assert!(faces.analyze(&frame).is_err());
        assert!(landmarks.locate(&frame).is_err());
    }
}
