//! ブロッキングな tar 処理と非同期アップロードをつなぐ有界パイプ
//!
//! 書き込み側は `std::io::Write` として blocking タスク上で動き、
//! 読み込み側は `Stream`（アップロード用）または `std::io::Read`
//! （後段の blocking 変換用）として使えます。チャネル容量は 1 チャンクで、
//! 読み手が追いつくまで書き手はブロックします。

use crate::error::{BuildError, Result};
use bytes::Bytes;
use futures_util::Stream;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 書き手が読み手より先行できるチャンク数
pub const PIPE_CAPACITY: usize = 1;

/// blocking 変換でのバッファサイズ（1 チャンクの目安）
pub const CHUNK_SIZE: usize = 32 * 1024;

type Chunk = io::Result<Bytes>;

/// パイプを作成
///
/// tokio ランタイム上で呼び出すこと（書き手はランタイムのハンドルを使って待機する）
pub fn pipe(cancel: CancellationToken) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeWriter {
            tx,
            cancel,
            handle: Handle::current(),
        },
        PipeReader {
            rx,
            pending: Bytes::new(),
        },
    )
}

/// パイプの書き込み側
///
/// drop すると読み手は EOF を受け取る
pub struct PipeWriter {
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
    handle: Handle,
}

impl PipeWriter {
    /// エラーを読み手に伝えてパイプを閉じる
    pub fn close_with_error(self, err: BuildError) {
        let tx = self.tx;
        let cancel = self.cancel;
        // 読み手が既にいない場合やキャンセル済みの場合は伝える相手がいない
        self.handle.block_on(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.send(Err(io::Error::other(err))) => {}
            }
        });
    }

    fn send(&self, chunk: Bytes) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other(BuildError::Cancelled));
        }
        self.handle.block_on(async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(io::Error::other(BuildError::Cancelled)),
                sent = self.tx.send(Ok(chunk)) => sent.map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "build context reader was closed")
                }),
            }
        })
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// パイプの読み込み側
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    pending: Bytes,
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            return Poll::Ready(Some(Ok(std::mem::take(&mut this.pending))));
        }
        this.rx.poll_recv(cx)
    }
}

/// blocking スレッド専用（非同期コンテキストから呼ぶとパニックする）
impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

/// blocking タスクで `produce` を実行し、その出力を読むパイプを返す
///
/// `produce` が失敗した場合、エラーは読み手に渡されパイプが閉じられる。
/// JoinHandle は成功時のみ値を返す（失敗は読み手側で観測する）。
pub fn spawn_transform<T, F>(
    cancel: &CancellationToken,
    produce: F,
) -> (PipeReader, JoinHandle<Option<T>>)
where
    T: Send + 'static,
    F: FnOnce(&mut PipeWriter) -> Result<T> + Send + 'static,
{
    let (mut writer, reader) = pipe(cancel.clone());
    let handle = tokio::task::spawn_blocking(move || match produce(&mut writer) {
        Ok(value) => Some(value),
        Err(err) => {
            let err = flatten(err);
            tracing::debug!("build context producer failed: {}", err);
            writer.close_with_error(err);
            None
        }
    });
    (reader, handle)
}

/// パイプ越しに届いた io::Error から元の BuildError を取り出す
pub fn into_build_error(err: io::Error) -> BuildError {
    if !err.get_ref().is_some_and(|inner| inner.is::<BuildError>()) {
        return BuildError::Io(err);
    }
    match err.into_inner().map(|inner| inner.downcast::<BuildError>()) {
        Some(Ok(build_err)) => *build_err,
        _ => BuildError::Archive("build context producer failed".to_string()),
    }
}

/// `?` で BuildError::Io に包まれたパイプ由来のエラーをほどく
fn flatten(err: BuildError) -> BuildError {
    match err {
        BuildError::Io(io_err) => into_build_error(io_err),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_blocks_when_reader_is_idle() {
        let cancel = CancellationToken::new();
        let (mut writer, reader) = pipe(cancel.clone());
        let written = Arc::new(AtomicUsize::new(0));

        let counter = written.clone();
        let producer = tokio::task::spawn_blocking(move || -> io::Result<()> {
            for _ in 0..3 {
                writer.write_all(b"chunk")?;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        // 1 チャンクだけバッファされ、2 チャンク目で書き手がブロックする
        assert_eq!(written.load(Ordering::SeqCst), 1);

        drop(reader);
        let err = producer.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(written.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_unblocks_writer() {
        let cancel = CancellationToken::new();
        let (mut writer, _reader) = pipe(cancel.clone());

        let producer = tokio::task::spawn_blocking(move || -> io::Result<()> {
            loop {
                writer.write_all(b"data")?;
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(into_build_error(err), BuildError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_receives_data_then_eof() {
        let cancel = CancellationToken::new();
        let (mut reader, handle) = spawn_transform(&cancel, |writer| {
            writer.write_all(b"hello ")?;
            writer.write_all(b"world")?;
            Ok(42)
        });

        let mut received = Vec::new();
        while let Some(chunk) = reader.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(received, b"hello world");
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_error_reaches_reader() {
        let cancel = CancellationToken::new();
        let (mut reader, handle) = spawn_transform(&cancel, |writer| -> Result<()> {
            writer.write_all(b"partial")?;
            Err(BuildError::Archive("broken header".to_string()))
        });

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"partial");

        let err = reader.next().await.unwrap().unwrap_err();
        match into_build_error(err) {
            BuildError::Archive(msg) => assert_eq!(msg, "broken header"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(reader.next().await.is_none());
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_read_across_chunks() {
        let cancel = CancellationToken::new();
        let (reader, _handle) = spawn_transform(&cancel, |writer| {
            for i in 0..10u8 {
                writer.write_all(&[i; 100])?;
            }
            Ok(())
        });

        let data = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map(|_| data)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(data.len(), 1000);
        assert_eq!(data[0], 0);
        assert_eq!(data[999], 9);
    }
}
