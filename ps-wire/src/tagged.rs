//! Request/reply tagging for `tokio_tower::multiplex`, letting one
//! connection carry many concurrently in-flight calls.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// A payload plus the tag `tokio_tower` uses to match a reply frame back to
/// its request. The tag rides alongside the bincode body rather than inside
/// the [`crate::RequestHeader`]/[`crate::ReplyHeader`] `timestamp` field,
/// which callers use for their own bookkeeping instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    pub tag: u32,
    pub v: T,
}

impl<T> Tagged<T> {
    pub fn new(tag: u32, v: T) -> Self {
        Tagged { tag, v }
    }
}

/// Hands out monotonically increasing tags for outbound requests and reads
/// them back off replies, the minimal `tokio_tower::multiplex::TagStore`
/// implementation.
#[derive(Debug, Default)]
pub struct Tagger(AtomicU32);

impl<Req, Resp> tokio_tower::multiplex::TagStore<Tagged<Req>, Tagged<Resp>> for Tagger {
    type Tag = u32;

    fn assign_tag(self: std::pin::Pin<&mut Self>, r: &mut Tagged<Req>) -> u32 {
        let tag = self.0.fetch_add(1, Ordering::Relaxed);
        r.tag = tag;
        tag
    }

    fn finish_tag(self: std::pin::Pin<&mut Self>, r: &Tagged<Resp>) -> u32 {
        r.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_increase_monotonically() {
        let mut tagger = Tagger::default();
        let pinned = std::pin::Pin::new(&mut tagger);
        let mut a: Tagged<()> = Tagged::new(0, ());
        let mut b: Tagged<()> = Tagged::new(0, ());
        let t1 = tokio_tower::multiplex::TagStore::<Tagged<()>, Tagged<()>>::assign_tag(pinned, &mut a);
        let pinned = std::pin::Pin::new(&mut tagger);
        let t2 = tokio_tower::multiplex::TagStore::<Tagged<()>, Tagged<()>>::assign_tag(pinned, &mut b);
        assert!(t2 > t1);
    }
}
