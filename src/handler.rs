//! The event-handler contract implemented by code that embeds the reactor.
use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;

/// Caller-supplied metadata associated with an endpoint or timer, used to
/// identify it in handler callbacks. Any small, cheaply-cloned, hashable
/// value works — a peer id, a connection index, an enum.
pub trait Tag: Clone + Eq + Hash + Debug + Send + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + 'static> Tag for T {}

/// Everything the reactor drives is an implementor of this trait. All
/// methods default to a no-op so a handler only overrides what it cares
/// about.
///
/// See the crate-level docs for the order in which these fire within a
/// single reactor pass, and the rule forbidding reads from `timer_expired`.
#[allow(unused_variables)]
pub trait Handler: Send {
    /// Caller-supplied metadata type threaded through every callback.
    type Tag: Tag;

    /// Outbound connect succeeded.
    fn client_init(&mut self, ctx: &mut super::Context<'_, Self::Tag>, tag: Self::Tag) {}

    /// Inbound connection accepted; `ctx.current_io()` is the new socket's tag.
    fn server_init(
        &mut self,
        ctx: &mut super::Context<'_, Self::Tag>,
        listener_tag: Self::Tag,
        addr: SocketAddr,
        port: u16,
    ) {
    }

    /// The current endpoint has data available to read.
    fn recv_data(&mut self, ctx: &mut super::Context<'_, Self::Tag>, tag: Self::Tag) {}

    /// A user timer fired.
    fn timer_expired(&mut self, ctx: &mut super::Context<'_, Self::Tag>, tag: Self::Tag) {}

    /// A read, write or connect-timeout error occurred; the endpoint is
    /// disposed immediately after this callback returns.
    fn error(&mut self, ctx: &mut super::Context<'_, Self::Tag>, tag: Self::Tag, detail: String) {}

    /// An outbound connect attempt failed.
    fn connect_error(
        &mut self,
        ctx: &mut super::Context<'_, Self::Tag>,
        tag: Self::Tag,
        detail: String,
    ) {
    }

    /// A queued user event is being delivered, in FIFO order.
    fn user_event(&mut self, ctx: &mut super::Context<'_, Self::Tag>, event: Box<dyn Any + Send>) {}
}
