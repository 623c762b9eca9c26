//! CLI command implementations.
//!
//! | Module     | Commands handled                                        |
//! |------------|---------------------------------------------------------|
//! | `pipeline` | `PreReceive`, `PostReceive`, `Build`, `Deploy`,         |
//! |            | `PostDeploy`, `RemoteDeploy`, `Start`, `Stop`           |
//! | `status`   | `Status`                                                |
//! | `marker`   | `Marker`                                                |
//! | `config`   | `Config`                                                |

pub mod config;
pub mod marker;
pub mod pipeline;
pub mod status;

pub use config::cmd_config;
pub use marker::cmd_marker;
pub use pipeline::{Stage, run_stage};
pub use status::cmd_status;
