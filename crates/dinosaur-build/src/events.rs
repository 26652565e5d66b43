//! ビルドストリームのデコード
//!
//! デーモンは `/build` のレスポンスとしてJSONメッセージを連続して返す。
//! 進捗・ログのメッセージは読み飛ばし、最初の `aux` メッセージからイメージIDを取り出す。
//! どこで止まっても、残りのストリームは最後まで読み捨てる。

use crate::error::Result;
use crate::progress::BuildProgress;
use bollard::models::{ErrorDetail, ImageId, ProgressDetail};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;

/// ビルドストリームの1メッセージ
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildEvent {
    pub id: Option<String>,
    pub stream: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
    #[serde(rename = "progressDetail")]
    pub progress_detail: Option<ProgressDetail>,
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
    /// 補助結果（ビルド結果のイメージIDなど）。デコードは後で行う
    pub aux: Option<serde_json::Value>,
}

impl BuildEvent {
    /// デーモンが報告したエラーメッセージ
    pub fn error_message(&self) -> Option<&str> {
        self.error_detail
            .as_ref()
            .and_then(|detail| detail.message.as_deref())
            .or(self.error.as_deref())
    }
}

/// デコード結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// `aux` からイメージIDを取得できた
    Found(String),
    /// `aux` を含むメッセージが無いままストリームが終わった
    NotFound,
    /// `aux` またはメッセージ自体を解釈できなかった
    Malformed(String),
}

impl ImageOutcome {
    fn from_aux(aux: serde_json::Value) -> Self {
        match serde_json::from_value::<ImageId>(canonical_id_key(aux)) {
            Ok(image) => match image.id {
                Some(id) if !id.is_empty() => ImageOutcome::Found(id),
                _ => ImageOutcome::Malformed("auxiliary result without image ID".to_string()),
            },
            Err(e) => ImageOutcome::Malformed(format!("invalid auxiliary result: {}", e)),
        }
    }

    /// 見つからなかった場合は空文字列
    pub fn image_id(&self) -> &str {
        match self {
            ImageOutcome::Found(id) => id,
            ImageOutcome::NotFound | ImageOutcome::Malformed(_) => "",
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ImageOutcome::Found(_))
    }
}

/// `ID` キーを大文字小文字を区別せずに受け付ける。完全一致があればそちらを優先
fn canonical_id_key(aux: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(mut fields) = aux else {
        return aux;
    };
    if !fields.contains_key("ID") {
        let key = fields
            .keys()
            .find(|k| k.eq_ignore_ascii_case("id"))
            .cloned();
        if let Some(value) = key.and_then(|k| fields.remove(&k)) {
            fields.insert("ID".to_string(), value);
        }
    }
    serde_json::Value::Object(fields)
}

/// ストリーム全体をデコードした結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub outcome: ImageOutcome,
    /// デコードしたメッセージ数
    pub events: usize,
    /// 最後にデーモンが報告したエラー
    pub daemon_error: Option<String>,
}

impl Default for BuildLog {
    fn default() -> Self {
        Self {
            outcome: ImageOutcome::NotFound,
            events: 0,
            daemon_error: None,
        }
    }
}

/// チャンク単位で届くバイト列からJSONメッセージを1つずつ取り出す
///
/// メッセージがチャンクをまたいでも、1チャンクに複数あってもよい。
/// 途中までのメッセージは、改行が届くか `finish` が呼ばれるまで再解析しない。
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: BytesMut,
    /// 未完成と判定した時点で改行の有無を確認済みのバイト数
    scanned: Option<usize>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// ストリームの終端。残りのバイト列を改行なしでも解析する
    pub fn finish(&mut self) {
        self.scanned = None;
    }

    /// 完全なメッセージがあれば返す。途中までしか無ければ `Ok(None)`
    pub fn next_event(&mut self) -> std::result::Result<Option<BuildEvent>, serde_json::Error> {
        if let Some(scanned) = self.scanned {
            if !self.buf[scanned..].contains(&b'\n') {
                self.scanned = Some(self.buf.len());
                return Ok(None);
            }
        }

        let (result, consumed) = {
            let mut records =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<BuildEvent>();
            match records.next() {
                None => (Ok(None), self.buf.len()),
                Some(Ok(event)) => (Ok(Some(event)), records.byte_offset()),
                Some(Err(e)) if e.is_eof() => {
                    self.scanned = Some(self.buf.len());
                    return Ok(None);
                }
                Some(Err(e)) => (Err(e), 0),
            }
        };
        self.scanned = None;
        self.buf.advance(consumed);
        result
    }

    /// 未完成のまま残っているバイト数（空白は除く）
    pub fn pending(&self) -> usize {
        let trailing = self
            .buf
            .iter()
            .rev()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        let leading = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.len().saturating_sub(leading + trailing)
    }
}

/// レスポンスストリームからイメージIDを取り出す
pub async fn extract_image_id<S>(stream: &mut S) -> Result<ImageOutcome>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let log = decode_build_stream(stream, &BuildProgress::hidden()).await?;
    Ok(log.outcome)
}

/// レスポンスストリームをデコードし、進捗を `progress` に反映する
///
/// 最初の `aux` メッセージで結果が決まる。その後もストリームは最後まで読み捨てる。
/// 転送エラーのみ `Err` になり、IDが無いことはエラーではない。
pub async fn decode_build_stream<S>(stream: &mut S, progress: &BuildProgress) -> Result<BuildLog>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut decoder = EventDecoder::new();
    let mut log = BuildLog::default();

    let mut finished = false;
    'decode: loop {
        loop {
            match decoder.next_event() {
                Ok(Some(event)) => {
                    log.events += 1;
                    observe(&event, progress, &mut log);
                    if let Some(aux) = event.aux {
                        log.outcome = ImageOutcome::from_aux(aux);
                        break 'decode;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log.outcome = ImageOutcome::Malformed(format!("invalid build event: {}", e));
                    break 'decode;
                }
            }
        }

        if finished {
            let pending = decoder.pending();
            if pending > 0 {
                log.outcome = ImageOutcome::Malformed(format!(
                    "truncated build event at end of stream ({} bytes)",
                    pending
                ));
            }
            break;
        }

        match stream.next().await {
            Some(chunk) => decoder.push(&chunk?),
            None => {
                decoder.finish();
                finished = true;
            }
        }
    }

    if let ImageOutcome::Malformed(detail) = &log.outcome {
        tracing::warn!("Could not read image ID from build stream: {}", detail);
    }

    drain(stream).await;

    tracing::debug!("Decoded {} build events: {:?}", log.events, log.outcome);
    Ok(log)
}

fn observe(event: &BuildEvent, progress: &BuildProgress, log: &mut BuildLog) {
    if let Some(text) = &event.stream {
        tracing::debug!("{}", text.trim_end());
        if let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) {
            progress.set_message(line.trim());
        }
    }

    if let Some(status) = &event.status {
        tracing::debug!("status: {}", status);
        progress.set_message(status);
    }

    if let Some(message) = event.error_message() {
        tracing::warn!("Build error from daemon: {}", message.trim_end());
        log.daemon_error = Some(message.trim_end().to_string());
    }
}

/// 残りのストリームを読み捨てる
async fn drain<S>(stream: &mut S)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut discarded = 0usize;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => discarded += bytes.len(),
            Err(e) => {
                tracing::warn!("Error while draining build stream: {}", e);
                break;
            }
        }
    }
    if discarded > 0 {
        tracing::debug!("Discarded {} trailing bytes of build stream", discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes>> + Unpin + use<> {
        let items: Vec<Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    const STEP: &str = "{\"stream\":\"Step 1/2 : FROM alpine\\n\"}\r\n";
    const RUN: &str = "{\"stream\":\" ---> Running in 4f2a\\n\"}\r\n";

    #[tokio::test]
    async fn test_progress_only_stream_is_not_found_and_drained() {
        let mut body = chunks(&[STEP, RUN, "{\"status\":\"Downloading\",\"progressDetail\":{}}\n"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome, ImageOutcome::NotFound);
        assert_eq!(outcome.image_id(), "");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aux_result_found_between_progress_events() {
        let aux = "{\"aux\":{\"ID\":\"abc123\"}}\r\n";
        let mut body = chunks(&[STEP, RUN, aux, STEP, RUN]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Found("abc123".to_string()));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aux_result_only_event() {
        let mut body = chunks(&["{\"aux\":{\"ID\":\"abc123\"}}"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "abc123");
    }

    #[tokio::test]
    async fn test_malformed_aux_yields_empty_id() {
        let mut body = chunks(&[STEP, "{\"aux\":{\"ID\":42}}\n", RUN]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert!(matches!(outcome, ImageOutcome::Malformed(_)));
        assert_eq!(outcome.image_id(), "");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aux_without_id_yields_empty_id() {
        let mut body = chunks(&["{\"aux\":{\"Digest\":\"sha256:1\"}}\n"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert!(matches!(outcome, ImageOutcome::Malformed(_)));
        assert_eq!(outcome.image_id(), "");
    }

    #[tokio::test]
    async fn test_first_aux_result_wins() {
        let mut body = chunks(&[
            "{\"aux\":{\"ID\":\"first\"}}\n",
            "{\"aux\":{\"ID\":\"second\"}}\n",
            STEP,
        ]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "first");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_first_aux_wins_within_single_chunk() {
        let both = "{\"aux\":{\"ID\":\"first\"}}\n{\"aux\":{\"ID\":\"second\"}}\n";
        let mut body = chunks(&[both]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "first");
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let mut body = chunks(&[
            "{\"stream\":\"Step 1/1\\n\"}\n{\"au",
            "x\":{\"ID\":\"sha256:",
            "deadbeef\"}}",
            "\n",
        ]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "sha256:deadbeef");
    }

    #[tokio::test]
    async fn test_null_aux_is_progress() {
        let mut body = chunks(&["{\"stream\":\"x\",\"aux\":null}\n"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome, ImageOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_invalid_json_is_malformed_and_drained() {
        let mut body = chunks(&[STEP, "{\"stream\": oops}\n", RUN]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert!(matches!(outcome, ImageOutcome::Malformed(_)));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_trailing_event_is_malformed() {
        let mut body = chunks(&[STEP, "{\"aux\":{\"ID\":\"abc"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert!(matches!(outcome, ImageOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut body = chunks(&[]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome, ImageOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_daemon_error_recorded() {
        let failure = "{\"errorDetail\":{\"code\":1,\"message\":\"The command '/bin/sh -c exit 1' returned a non-zero code: 1\"},\"error\":\"The command '/bin/sh -c exit 1' returned a non-zero code: 1\"}\r\n";
        let mut body = chunks(&[STEP, RUN, failure]);

        let log = decode_build_stream(&mut body, &BuildProgress::hidden())
            .await
            .unwrap();
        assert_eq!(log.outcome, ImageOutcome::NotFound);
        assert_eq!(log.events, 3);
        assert_eq!(
            log.daemon_error.as_deref(),
            Some("The command '/bin/sh -c exit 1' returned a non-zero code: 1")
        );
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(STEP.as_bytes())),
            Err(std::io::Error::other("connection reset").into()),
        ];
        let mut body = stream::iter(items);

        assert!(extract_image_id(&mut body).await.is_err());
    }

    #[tokio::test]
    async fn test_aux_id_key_is_case_insensitive() {
        let mut body = chunks(&[STEP, "{\"aux\":{\"id\":\"abc123\"}}\n"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Found("abc123".to_string()));
    }

    #[tokio::test]
    async fn test_exact_id_key_preferred() {
        let mut body = chunks(&["{\"aux\":{\"id\":\"lower\",\"ID\":\"exact\"}}\n"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "exact");
    }

    #[tokio::test]
    async fn test_final_record_without_newline_after_split() {
        let mut body = chunks(&[STEP, "{\"aux\":{\"ID\":\"abc", "123\"}}"]);

        let outcome = extract_image_id(&mut body).await.unwrap();
        assert_eq!(outcome.image_id(), "abc123");
    }

    #[test]
    fn test_decoder_defers_reparse_until_newline() {
        let mut decoder = EventDecoder::new();
        decoder.push(b"{\"stream\":\"a");
        assert!(decoder.next_event().unwrap().is_none());

        decoder.push(b"bc\"}");
        assert!(decoder.next_event().unwrap().is_none());

        decoder.finish();
        let event = decoder.next_event().unwrap().unwrap();
        assert_eq!(event.stream.as_deref(), Some("abc"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_waits_for_complete_record() {
        let mut decoder = EventDecoder::new();
        decoder.push(b"{\"stream\":\"par");
        assert!(decoder.next_event().unwrap().is_none());
        assert!(decoder.pending() > 0);

        decoder.push(b"tial\"}\n  ");
        let event = decoder.next_event().unwrap().unwrap();
        assert_eq!(event.stream.as_deref(), Some("partial"));
        assert!(decoder.next_event().unwrap().is_none());
        assert_eq!(decoder.pending(), 0);
    }
}
