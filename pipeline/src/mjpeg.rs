use bytes::{BufMut, Bytes, BytesMut};
use image::RgbImage;
use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::source::{SourceError, VideoSource};

/// Boundary name used for the annotated stream we serve.
pub const BOUNDARY_NAME: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 64 * 1024;

/// Wrap one JPEG as a `multipart/x-mixed-replace` part:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    buf.put_slice(PART_HEADER);
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse state for a multipart JPEG stream.
#[derive(Debug, Clone, Copy)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes, either a known length or up to the next boundary.
    CollectingJpeg { content_length: Option<usize> },
}

/// Incremental splitter for `multipart/x-mixed-replace` JPEG streams.
///
/// Feed arbitrary chunks with [`push`](Self::push); complete JPEG payloads
/// come out as soon as they can be delimited. Parts that declare a
/// `Content-Length` are emitted without waiting for the next boundary.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    scan_from: usize,
}

impl MultipartParser {
    pub fn new(boundary_name: &str) -> Self {
        let name = boundary_name.trim_start_matches("--");
        Self {
            boundary: format!("--{name}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Append a chunk and return every JPEG payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + self.boundary.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        let keep = self.boundary.len();
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let headers = self.buffer.split_to(pos + HEADER_END.len());
                        let content_length = parse_content_length(&headers[..pos]);
                        self.scan_from = 0;
                        self.state = ParseState::CollectingJpeg { content_length };
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg {
                    content_length: Some(len),
                } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let jpeg = self.buffer.split_to(len).to_vec();
                    if !jpeg.is_empty() {
                        frames.push(jpeg);
                    }
                    self.state = ParseState::SeekingBoundary;
                }
                ParseState::CollectingJpeg {
                    content_length: None,
                } => {
                    let search = &self.buffer[self.scan_from..];
                    if let Some(pos) = find_subsequence(search, &self.boundary) {
                        let jpeg_end = self.scan_from + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2 && &self.buffer[jpeg_end - 2..jpeg_end] == b"\r\n"
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };
                        let jpeg = self.buffer[..end].to_vec();
                        let _ = self.buffer.split_to(jpeg_end + self.boundary.len());
                        if !jpeg.is_empty() {
                            frames.push(jpeg);
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Avoid re-scanning bytes already known not to start a boundary
                        self.scan_from = self.buffer.len().saturating_sub(self.boundary.len());
                        break;
                    }
                }
            }
        }

        frames
    }
}

/// Extract the `boundary=` parameter from a multipart Content-Type header.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Network camera publishing an MJPEG multipart stream over HTTP.
pub struct MjpegHttpSource {
    url: String,
    response: Option<reqwest::blocking::Response>,
    parser: MultipartParser,
    pending: VecDeque<Vec<u8>>,
    chunk: Vec<u8>,
}

impl MjpegHttpSource {
    /// Connect to `url`. Fails with `DeviceUnavailable` if the camera cannot
    /// be reached or answers with a non-success status.
    pub fn open(url: &str, connect_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .map_err(|e| SourceError::DeviceUnavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError::DeviceUnavailable(format!(
                "{url}: HTTP status {}",
                response.status().as_u16()
            )));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| BOUNDARY_NAME.to_string());

        info!(url, boundary, status = %response.status(), "connected to MJPEG stream");

        Ok(Self {
            url: url.to_string(),
            response: Some(response),
            parser: MultipartParser::new(&boundary),
            pending: VecDeque::new(),
            chunk: vec![0; READ_CHUNK],
        })
    }
}

impl VideoSource for MjpegHttpSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        loop {
            if let Some(jpeg) = self.pending.pop_front() {
                match image::load_from_memory(&jpeg) {
                    Ok(img) => return Ok(img.to_rgb8()),
                    Err(e) => {
                        warn!(error = %e, bytes = jpeg.len(), "undecodable stream part, skipping");
                        continue;
                    }
                }
            }

            let response = self
                .response
                .as_mut()
                .ok_or_else(|| SourceError::ReadFailure("source already released".into()))?;
            let n = response
                .read(&mut self.chunk)
                .map_err(|e| SourceError::ReadFailure(e.to_string()))?;
            if n == 0 {
                return Err(SourceError::ReadFailure("stream ended".into()));
            }
            let frames = self.parser.push(&self.chunk[..n]);
            if !frames.is_empty() {
                debug!(parts = frames.len(), "stream parts completed");
            }
            self.pending.extend(frames);
        }
    }

    fn release(&mut self) {
        if self.response.take().is_some() {
            info!(url = self.url, "MJPEG stream connection closed");
        }
    }

    fn name(&self) -> &str {
        "mjpeg-http"
    }
}

impl Drop for MjpegHttpSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| encode_part(p).to_vec()).collect()
    }

    #[test]
    fn part_layout() {
        let part = encode_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n"
        );
    }

    #[test]
    fn parts_complete_when_next_boundary_arrives() {
        let mut parser = MultipartParser::new("frame");
        let stream = stream_of(&[&b"first-jpeg"[..], &b"second-jpeg"[..]]);
        let frames = parser.push(&stream);
        // The last part has no closing boundary yet.
        assert_eq!(frames, vec![b"first-jpeg".to_vec()]);
        let frames = parser.push(b"--frame\r\n");
        assert_eq!(frames, vec![b"second-jpeg".to_vec()]);
    }

    #[test]
    fn boundary_split_across_chunks() {
        let mut stream = stream_of(&[&b"aaaa"[..], &b"bbbbbbbb"[..], &b"cc"[..]]);
        stream.extend_from_slice(b"--frame\r\n");

        for chunk_size in [1, 2, 3, 7, 16] {
            let mut parser = MultipartParser::new("frame");
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(parser.push(chunk));
            }
            assert_eq!(
                frames,
                vec![b"aaaa".to_vec(), b"bbbbbbbb".to_vec(), b"cc".to_vec()],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn content_length_parts_emit_immediately() {
        let mut parser = MultipartParser::new("--myboundary");
        let stream =
            b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\nhello\r\n";
        assert_eq!(parser.push(stream), vec![b"hello".to_vec()]);
        let next = b"--myboundary\r\ncontent-length: 3\r\n\r\nabc";
        assert_eq!(parser.push(next), vec![b"abc".to_vec()]);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut parser = MultipartParser::new("frame");
        let mut stream = b"HTTP preamble junk\r\n".to_vec();
        stream.extend(stream_of(&[&b"payload"[..]]));
        stream.extend_from_slice(b"--frame\r\n");
        assert_eq!(parser.push(&stream), vec![b"payload".to_vec()]);
    }

    #[test]
    fn boundary_from_header() {
        assert_eq!(
            boundary_from_content_type(STREAM_CONTENT_TYPE).as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[test]
    fn encoded_frames_survive_the_parser() {
        let frame = RgbImage::from_pixel(32, 24, image::Rgb([200, 10, 10]));
        let jpeg = crate::sink::encode_jpeg(&frame, 90).unwrap();
        let mut stream = encode_part(&jpeg).to_vec();
        stream.extend_from_slice(b"--frame\r\n");

        let mut parser = MultipartParser::new("frame");
        let frames = parser.push(&stream);
        assert_eq!(frames.len(), 1);
        let decoded = image::load_from_memory(&frames[0]).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 24));
    }
}
