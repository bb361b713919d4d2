//! Typed accumulation and dispatch on top of the frame layer.
//!
//! A [ReceptionManager] drives one START…END window, routing data frames
//! by tag into typed slots; a [TransmissionManager] collects typed items
//! and streams them out as one session.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::frame::{Frame, Receiver, Sender};

/// Integers on the wire are ASCII decimal; anything longer than this can
/// not fit an i64 and is rejected before parsing.
const MAX_INT_LEN: usize = 20;

enum RxSlot {
    Void,
    Bool(bool),
    Bytes(Option<Bytes>),
    Int(Option<i64>),
    Str(Option<String>),
}

struct RxEntry {
    tag: u8,
    seen: bool,
    slot: RxSlot,
}

/// Routes received data frames into typed slots by tag. Unknown tags fall
/// through to the chained `next` manager when there is one, otherwise they
/// are an [io::ErrorKind::Unsupported] error.
#[derive(Default)]
pub struct ReceptionManager {
    entries: Vec<RxEntry>,
    next: Option<Box<ReceptionManager>>,
}

impl ReceptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next(next: ReceptionManager) -> Self {
        Self {
            entries: Vec::new(),
            next: Some(Box::new(next)),
        }
    }

    fn register(&mut self, tag: u8, slot: RxSlot) {
        self.entries.push(RxEntry {
            tag,
            seen: false,
            slot,
        });
    }

    /// A presence-only tag: the value is ignored, only `seen` is tracked.
    pub fn expect_void(&mut self, tag: u8) {
        self.register(tag, RxSlot::Void);
    }

    /// A boolean: any non-empty value is true.
    pub fn expect_bool(&mut self, tag: u8) {
        self.register(tag, RxSlot::Bool(false));
    }

    pub fn expect_bytes(&mut self, tag: u8) {
        self.register(tag, RxSlot::Bytes(None));
    }

    pub fn expect_int(&mut self, tag: u8) {
        self.register(tag, RxSlot::Int(None));
    }

    pub fn expect_str(&mut self, tag: u8) {
        self.register(tag, RxSlot::Str(None));
    }

    /// Routes one data frame. Fails with [io::ErrorKind::Unsupported] when
    /// no manager in the chain covers the tag.
    pub fn submit(&mut self, tag: u8, value: &[u8]) -> io::Result<()> {
        for entry in &mut self.entries {
            if entry.tag != tag {
                continue;
            }
            entry.seen = true;
            match &mut entry.slot {
                RxSlot::Void => {}
                RxSlot::Bool(b) => *b = !value.is_empty(),
                RxSlot::Bytes(slot) => *slot = Some(Bytes::copy_from_slice(value)),
                RxSlot::Int(slot) => {
                    if value.len() >= MAX_INT_LEN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("integer value too long for tag {}", tag),
                        ));
                    }
                    let text = std::str::from_utf8(value).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "integer value not ASCII")
                    })?;
                    *slot = Some(text.parse::<i64>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "integer value not decimal")
                    })?);
                }
                RxSlot::Str(slot) => {
                    let text = std::str::from_utf8(value).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "string value not UTF-8")
                    })?;
                    *slot = Some(text.to_string());
                }
            }
            return Ok(());
        }
        if let Some(next) = &mut self.next {
            return next.submit(tag, value);
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no slot for tag {}", tag),
        ))
    }

    /// Whether a frame with this tag arrived (any slot kind).
    pub fn seen(&self, tag: u8) -> bool {
        if self.entries.iter().any(|e| e.tag == tag && e.seen) {
            return true;
        }
        self.next.as_ref().map(|n| n.seen(tag)).unwrap_or(false)
    }

    pub fn bool(&self, tag: u8) -> bool {
        self.entries
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| matches!(e.slot, RxSlot::Bool(true)))
            .unwrap_or(false)
    }

    pub fn int(&self, tag: u8) -> Option<i64> {
        self.entries.iter().find_map(|e| {
            if e.tag != tag {
                return None;
            }
            match e.slot {
                RxSlot::Int(v) => v,
                _ => None,
            }
        })
    }

    pub fn take_bytes(&mut self, tag: u8) -> Option<Bytes> {
        self.entries.iter_mut().find_map(|e| {
            if e.tag != tag {
                return None;
            }
            match &mut e.slot {
                RxSlot::Bytes(v) => v.take(),
                _ => None,
            }
        })
    }

    pub fn take_str(&mut self, tag: u8) -> Option<String> {
        self.entries.iter_mut().find_map(|e| {
            if e.tag != tag {
                return None;
            }
            match &mut e.slot {
                RxSlot::Str(v) => v.take(),
                _ => None,
            }
        })
    }

    /// Drives the remainder of one session: routes data frames until END.
    /// On CHECK the abort callback is consulted; a true return aborts the
    /// reception with [io::ErrorKind::Interrupted]. The leading START frame
    /// is tolerated but not required, so this can be called either before
    /// or after the caller has consumed it.
    pub async fn receive_session<R: AsyncRead + Unpin>(
        &mut self,
        rx: &mut Receiver<R>,
        abort: Option<&(dyn Fn() -> bool + Send + Sync)>,
    ) -> io::Result<()> {
        loop {
            match rx.receive().await? {
                Frame::Start => {}
                Frame::End => return Ok(()),
                Frame::Check => {
                    trace!("check frame");
                    if let Some(cb) = abort {
                        if cb() {
                            return Err(io::Error::new(
                                io::ErrorKind::Interrupted,
                                "reception aborted",
                            ));
                        }
                    }
                }
                Frame::Data { tag, value } => self.submit(tag, &value)?,
            }
        }
    }
}

enum TxItem {
    Bool(bool),
    Bytes(Bytes),
    Int(i64),
    Str(String),
    /// Pulled repeatedly until it yields `None`; each chunk becomes one
    /// frame with the item's tag.
    Stream(Box<dyn FnMut() -> io::Result<Option<Bytes>> + Send>),
}

/// Accumulates typed items and streams them as data frames, optionally
/// bracketed by START/END.
#[derive(Default)]
pub struct TransmissionManager {
    items: Vec<(u8, TxItem)>,
}

impl TransmissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Booleans are framed as the original protocol does: true is "1",
    /// false is an empty value.
    pub fn add_bool(&mut self, tag: u8, value: bool) {
        self.items.push((tag, TxItem::Bool(value)));
    }

    pub fn add_bytes(&mut self, tag: u8, value: impl Into<Bytes>) {
        self.items.push((tag, TxItem::Bytes(value.into())));
    }

    pub fn add_int(&mut self, tag: u8, value: i64) {
        self.items.push((tag, TxItem::Int(value)));
    }

    pub fn add_str(&mut self, tag: u8, value: impl Into<String>) {
        self.items.push((tag, TxItem::Str(value.into())));
    }

    pub fn add_stream(
        &mut self,
        tag: u8,
        source: impl FnMut() -> io::Result<Option<Bytes>> + Send + 'static,
    ) {
        self.items.push((tag, TxItem::Stream(Box::new(source))));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Streams all items in insertion order. With `framed`, the items are
    /// bracketed in one START…END session.
    pub async fn send<W: AsyncWrite + Unpin>(
        &mut self,
        tx: &mut Sender<W>,
        framed: bool,
    ) -> io::Result<()> {
        if framed {
            tx.start().await?;
        }
        for (tag, item) in &mut self.items {
            match item {
                TxItem::Bool(v) => {
                    let value: &[u8] = if *v { b"1" } else { b"" };
                    tx.data(*tag, value).await?;
                }
                TxItem::Bytes(v) => tx.data(*tag, v).await?,
                TxItem::Int(v) => tx.data_int(*tag, *v).await?,
                TxItem::Str(v) => tx.data(*tag, v.as_bytes()).await?,
                TxItem::Stream(source) => {
                    while let Some(chunk) = source()? {
                        tx.data(*tag, &chunk).await?;
                    }
                }
            }
        }
        if framed {
            tx.end().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn pipe() -> (
        Sender<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        Receiver<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (_, cw) = tokio::io::split(client);
        let (sr, _) = tokio::io::split(server);
        (Sender::new(cw), Receiver::new(sr))
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let (mut tx, mut rx) = pipe().await;

        let mut out = TransmissionManager::new();
        out.add_int(1, 3);
        out.add_str(12, "/some/path");
        out.add_bool(17, true);
        out.add_bool(18, false);
        out.add_bytes(11, &b"deadbeef"[..]);
        out.send(&mut tx, true).await.unwrap();

        let mut in_ = ReceptionManager::new();
        in_.expect_int(1);
        in_.expect_str(12);
        in_.expect_bool(17);
        in_.expect_bool(18);
        in_.expect_bytes(11);
        in_.receive_session(&mut rx, None).await.unwrap();

        assert_eq!(in_.int(1), Some(3));
        assert_eq!(in_.take_str(12).as_deref(), Some("/some/path"));
        assert!(in_.bool(17));
        assert!(!in_.bool(18));
        assert_eq!(in_.take_bytes(11).as_deref(), Some(&b"deadbeef"[..]));
        assert!(in_.seen(17));
        assert!(in_.seen(18));
        assert!(!in_.seen(2));
    }

    #[tokio::test]
    async fn unknown_tag_falls_through_to_next() {
        let mut inner = ReceptionManager::new();
        inner.expect_int(42);
        let mut outer = ReceptionManager::with_next(inner);
        outer.expect_str(12);

        outer.submit(12, b"path").unwrap();
        outer.submit(42, b"7").unwrap();
        let err = outer.submit(99, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(outer.seen(42));
    }

    #[tokio::test]
    async fn check_frame_consults_abort_callback() {
        let (mut tx, mut rx) = pipe().await;
        tx.start().await.unwrap();
        tx.data_int(1, 5).await.unwrap();
        tx.check().await.unwrap();
        tx.end().await.unwrap();

        let mut mgr = ReceptionManager::new();
        mgr.expect_int(1);
        let err = mgr
            .receive_session(&mut rx, Some(&|| true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn stream_item_emits_one_frame_per_chunk() {
        let (mut tx, mut rx) = pipe().await;
        let chunks = vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")];
        let mut remaining = chunks.clone();
        remaining.reverse();

        let mut out = TransmissionManager::new();
        out.add_stream(21, move || Ok(remaining.pop()));
        out.send(&mut tx, true).await.unwrap();

        assert_eq!(rx.receive().await.unwrap(), Frame::Start);
        for chunk in chunks {
            assert_eq!(
                rx.receive().await.unwrap(),
                Frame::Data {
                    tag: 21,
                    value: chunk,
                }
            );
        }
        assert_eq!(rx.receive().await.unwrap(), Frame::End);
    }

    #[tokio::test]
    async fn bad_int_value_is_invalid_data() {
        let mut mgr = ReceptionManager::new();
        mgr.expect_int(14);
        let err = mgr.submit(14, b"not a number").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
