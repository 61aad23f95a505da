//! LOS HTTP back-end.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, CORS, TraceLayer)      │
//! │  (SPA)   │ <─────── │    ├─ api.rs  (goals, tasks, progress, prefs)    │
//! └──────────┘ WebSocket│    ├─ account.rs  (/auth/*)                      │
//!                       │    ├─ notifications.rs  (/notifications/*)       │
//!                       │    ├─ admin.rs  (/admin/*)                       │
//!                       │    └─ ws.rs  (/ws/{user_email}, WsHub)           │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (LosDb behind DbHandle)                  │
//!                       │                                                  │
//!                       │  reminders.rs ──> push.rs ──> Web Push service   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | Shared types: `User`, `Goal`, `Task`, `Preferences`         |
//! | `auth`    | Password hashing, JWTs, `CurrentUser`/`AdminUser` extractors |
//! | `push`    | `PushSender` trait, VAPID sender                            |
//! | `extract` | `Json`/`Path`/`Query`/`Form` with `{"detail"}` rejections   |
//!
//! ## Typical Request Flow (complete a task)
//!
//! 1. `PATCH /tasks/{id}` → `CurrentUser` decodes the bearer token.
//! 2. `api::update_task` checks ownership and updates the row inside one
//!    `DbHandle::call`.
//! 3. The updated task is returned and a `task_updated` message goes to
//!    every open WebSocket of that user through `WsHub`.

pub mod account;
pub mod admin;
pub mod api;
pub mod auth;
pub mod db;
pub mod extract;
pub mod models;
pub mod notifications;
pub mod push;
pub mod reminders;
pub mod server;
pub mod ws;
