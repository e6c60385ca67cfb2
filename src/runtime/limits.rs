//! Runtime limits and constants.

/// Maximum number of unprocessed external events carried into the next
/// execution by `continue_as_new(.., keep_unprocessed_events = true)`.
///
/// When the list exceeds this limit the oldest events are dropped and a
/// warning is logged.
pub const MAX_CARRY_FORWARD_EVENTS: usize = 20;

/// Maximum size in bytes for the custom status string set via
/// `ctx.set_custom_status()`.
///
/// A turn that leaves a larger custom status fails the orchestration.
pub const MAX_CUSTOM_STATUS_BYTES: usize = 256 * 1024;

/// Page size used by `list_instance_ids` when the caller passes zero.
pub const DEFAULT_PAGE_SIZE: usize = 100;
