//! Shared test doubles for the Chronicle persistence engine.

mod clock;
mod factory;
mod tally;
mod unit_of_work;

pub use clock::{FixedClock, SteppingClock};
pub use factory::FailingFactory;
pub use tally::{
    Tally, TallyEvent, TallyEventKind, TallyMemento, TallyNotification, TallyNotice, tally_event,
};
pub use unit_of_work::FlakyDatabase;
