//! Turn orchestration for the concierge assistant.
//!
//! A chat message flows through a constrained loop:
//! 1. **Routing** (`router`) - cheap pattern classification; date/time and
//!    greetings are answered on the spot without touching any collaborator.
//! 2. **Context** (`context`) - preferences, open tasks, recent turns and
//!    semantic recall fetched in parallel, each under its own budget.
//! 3. **Handling** (`handlers`) - one handler per intent category, calling
//!    external services through the supervisor.
//! 4. **Reply** - sent exactly once through the messaging transport.
//! 5. **Memory** (`deferred`) - persistence queued after the reply and applied
//!    by a background consumer.
//!
//! The completion service is strictly a translator from text to fields. It
//! never decides which action runs or whether an email is sent.

pub mod context;
pub mod deferred;
pub mod handlers;
pub mod llm;
pub mod router;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use runtime::{AgentRuntime, RuntimeServices};
