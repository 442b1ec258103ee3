pub mod endpoint;
pub mod executor;
pub mod manager;
pub mod scheduler;
pub mod selector;

pub mod prelude {
    pub use super::endpoint::{Connection, Endpoint, Ready, Selectable, SelectorKey};
    pub use super::executor::{job, Executor, Job, Rejected, ThreadPool};
    pub use super::manager::{
        connection_pending, finish_connect, Attachment, SelectorManager, SelectorPool,
    };
    pub use super::scheduler::{Scheduler, TimerHandle, TimerThread};
    pub use super::selector::{
        ManagedSelector, SelectorConfig, SelectorError, SelectorStats, SelectorUpdate, Update,
    };
    pub use mio::{Interest, Token};
}
