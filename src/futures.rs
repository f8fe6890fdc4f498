use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};

#[derive(Debug)]
enum Slot {
    /// Correlated to a sequence id in history.
    Bound(u64),
    /// Failed before reaching history; resolves once with the error.
    Rejected(Option<String>),
    /// Call site diverged from history; never resolves.
    Stalled,
}

/// Future for one activity call site. Resolves to the recorded result, or to
/// the recorded failure message, and stays pending while the activity is
/// outstanding.
pub struct DurableFuture {
    slot: Slot,
    ctx: OrchestrationContext,
}

impl DurableFuture {
    pub(crate) fn bound(id: u64, ctx: OrchestrationContext) -> Self {
        Self {
            slot: Slot::Bound(id),
            ctx,
        }
    }

    pub(crate) fn rejected(message: String, ctx: OrchestrationContext) -> Self {
        Self {
            slot: Slot::Rejected(Some(message)),
            ctx,
        }
    }

    pub(crate) fn stalled(ctx: OrchestrationContext) -> Self {
        Self { slot: Slot::Stalled, ctx }
    }

    /// Sequence id of the call site, if it was bound to history.
    pub fn sequence_id(&self) -> Option<u64> {
        match self.slot {
            Slot::Bound(id) => Some(id),
            _ => None,
        }
    }

    /// Await the activity result decoded to a typed value.
    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        async move {
            let s = self.await?;
            Json::decode::<Out>(&s)
        }
    }
}

impl std::fmt::Debug for DurableFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFuture").field("slot", &self.slot).finish()
    }
}

impl Future for DurableFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.slot {
            Slot::Bound(id) => match this.ctx.outcome(*id) {
                Some(out) => Poll::Ready(out),
                None => Poll::Pending,
            },
            Slot::Rejected(msg) => match msg.take() {
                Some(m) => Poll::Ready(Err(m)),
                None => Poll::Pending,
            },
            Slot::Stalled => Poll::Pending,
        }
    }
}

/// Fan-in over a set of durable futures. Ready only when every member has an
/// outcome; the outputs keep the order the futures were given in, regardless
/// of the order their completions were recorded.
pub struct JoinFuture {
    members: Vec<DurableFuture>,
    outputs: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(members: Vec<DurableFuture>) -> Self {
        let outputs = members.iter().map(|_| None).collect();
        Self { members, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for (member, slot) in this.members.iter_mut().zip(this.outputs.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            match Pin::new(member).poll(cx) {
                Poll::Ready(out) => *slot = Some(out),
                Poll::Pending => pending = true,
            }
        }
        if pending {
            return Poll::Pending;
        }
        Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
    }
}
