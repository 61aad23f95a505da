//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `db`            | `InitDb`                                           |
//! | `config`        | `Config`                                           |
//! | `admin`         | `Admin`                                            |

pub mod admin;
pub mod config;
pub mod db;
pub mod serve;

pub use admin::cmd_admin;
pub use config::cmd_config;
pub use db::cmd_init_db;
pub use serve::cmd_serve;
