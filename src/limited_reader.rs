/// 有限读取器模块
///
/// 升级请求头在交给 WebSocket 之前由服务端自行读取，
/// 用它限制请求头的总字节数，防止超大请求头耗尽内存
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// 有限读取器 - 限制可以读取的最大字节数
pub struct LimitedReader<R> {
    inner: R,
    remaining: usize,
    limit: usize,
}

impl<R> LimitedReader<R> {
    /// 创建新的有限读取器
    pub fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
            limit,
        }
    }

    /// 获取剩余可读字节数
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// 获取总限制
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 获取已读取字节数
    pub fn read_count(&self) -> usize {
        self.limit - self.remaining
    }

    /// 消费 LimitedReader，返回内部读取器
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// 判断错误是否由超出读取上限引起
pub fn is_limit_exceeded(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidData
        && err
            .get_ref()
            .is_some_and(|inner| inner.to_string().starts_with("read limit exceeded"))
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("read limit exceeded: {} bytes", self.limit),
            )));
        }

        let before = buf.filled().len();

        // 缓冲区比剩余额度大时，先读到临时缓冲区再拷贝，保证不越过上限
        let result = if buf.remaining() <= self.remaining {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        } else {
            let mut tmp = vec![0u8; self.remaining];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            let result = Pin::new(&mut self.inner).poll_read(cx, &mut tmp_buf);
            if let Poll::Ready(Ok(())) = result {
                buf.put_slice(tmp_buf.filled());
            }
            result
        };

        if let Poll::Ready(Ok(())) = result {
            let read = buf.filled().len() - before;
            self.remaining = self.remaining.saturating_sub(read);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_within_limit() {
        let data: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        let mut reader = LimitedReader::new(data, 64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.read_count(), data.len());
        assert_eq!(reader.remaining(), 64 - data.len());
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let data = vec![b'a'; 100];
        let mut reader = LimitedReader::new(&data[..], 10);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(is_limit_exceeded(&err));
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn test_exact_limit_then_eof() {
        let data = vec![b'a'; 10];
        let mut reader = LimitedReader::new(&data[..], 10);
        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.into_inner().len(), 0);
    }

    #[test]
    fn test_other_errors_are_not_limit() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert!(!is_limit_exceeded(&err));
    }
}
