//! Polymorphic actions.
//!
//! `C` is the context an action runs against. The node crate instantiates it
//! with its runtime handle; tests here use plain structs.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Object-safe unit of remote or local work.
pub trait Action<C: ?Sized + 'static>: Send + 'static {
    /// Stable type tag written to the wire.
    fn tag(&self) -> &str;

    /// Run the action. Consumes it: a parcel is invoked exactly once.
    fn invoke(self: Box<Self>, ctx: &C);

    /// Owned copy, used when an action is queued for writing.
    fn clone_action(&self) -> Box<dyn Action<C>>;

    /// Serialize the body (without tag or length prefix).
    fn encode_body(&self) -> Result<Vec<u8>>;
}

impl<C: ?Sized + 'static> std::fmt::Debug for dyn Action<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action").field("tag", &self.tag()).finish()
    }
}

/// Serde-backed action with a compile-time tag.
///
/// Implementing this is the usual way to define an action; the blanket impl
/// below provides [`Action`] and [`crate::ActionRegistry::register_typed`]
/// provides the matching decoder.
pub trait TypedAction<C: ?Sized + 'static>:
    Serialize + DeserializeOwned + Clone + Send + 'static
{
    const TAG: &'static str;

    fn invoke(self, ctx: &C);
}

impl<C, A> Action<C> for A
where
    C: ?Sized + 'static,
    A: TypedAction<C>,
{
    fn tag(&self) -> &str {
        <A as TypedAction<C>>::TAG
    }

    fn invoke(self: Box<Self>, ctx: &C) {
        <A as TypedAction<C>>::invoke(*self, ctx)
    }

    fn clone_action(&self) -> Box<dyn Action<C>> {
        Box::new(self.clone())
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
