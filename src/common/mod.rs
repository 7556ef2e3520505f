pub mod frame;
pub mod region;
pub mod state;
pub mod ticket;

pub use frame::{Frame, FrameOrigin};
pub use region::Region;
pub use state::{EventBus, PipelineEvent, PipelineState, StateCell};
pub use ticket::Ticket;
