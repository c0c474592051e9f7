pub mod callback_queue;
pub mod service_state;

/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// # Functionality
/// State machines operate on defined inputs and outputs. The session lifecycle of a context and
/// the outbound callback queue of a peer are both modelled this way: producers encode *what
/// happened* as an [`Input`](StateMachine::Input) variant, and the owner of the machine polls for
/// the resulting [`Output`](StateMachine::Output).
///
/// Separating the grouping and mapping semantics into this trait allows the machine to stay
/// focused on transition logic rather than on how it is driven. The owning container decides how
/// the machine is synchronized (a per-peer lock, an async mutex around a context) and which side
/// effects (notifications, logging, wake signals) follow from an output.
///
/// # Invariants
/// A [`StateMachine`] must be pure in that its operation does not depend on any external behavior
/// of the broader system. Implementors *must* uphold all the following invariants.
///
/// ## No Interior Mutability
/// All data is either immutable or mutable only through `&mut` access. No [`std::cell`] or
/// [`std::sync`] lock containers. Payloads shared through [`Arc`](std::sync::Arc) must be
/// immutable, like the serialized arguments of a broadcast callback.
///
/// ## No IO
/// No [`std::io`], [`std::net`], or transport access. A machine never talks to a peer; it only
/// decides what should be said.
///
/// ### No System Time
/// Reading [`std::time::Instant::now`] makes two otherwise identical runs diverge. Liveness
/// decisions that need a clock take the timestamp as input instead.
///
/// ## No Concurrency
/// No threads and no async. The containers that own a machine are responsible for scheduling.
///
/// ## No Blocking
/// Processing an input or polling an output must return promptly, so a machine can be driven
/// while a lock is held on a hot path (for example while a callback is enqueued for a peer).
///
/// # Side Effects
/// Logging is allowed as a side effect as long as the machine's logic never depends on its
/// outcome.
///
/// # Example
/// ```ignore
/// let mut machine = ServiceStateMachine::new();
///
/// machine.process_input(ServiceEvent::Open);
/// match machine.poll_output() {
///     Some(ServiceOutput::Changed(change)) => notify(change),
///     Some(ServiceOutput::Rejected { state, event }) => return Err(reject(state, event)),
///     None => {}
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    ///
    /// This is often an enum containing all the possible variants of input, but can also be a
    /// struct when there is only one input variant.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    ///
    /// This is often an enum containing all the possible variants of output, but can also be a
    /// struct when there is only one output variant.
    type Output;

    /// Process the provided `input` into the state machine.
    ///
    /// The implementor of this method provides the dispatch mapping from the unified
    /// [`Input`](StateMachine::Input) type of this trait to the corresponding method
    /// of the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    ///
    /// The implementor of this trait provides the dispatch mapping from the polling methods of
    /// the state machine to the unified [`Output`](StateMachine::Output) type of this trait.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
