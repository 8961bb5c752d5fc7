//! VPN Supervisor - lifecycle management for a single VPN client process
//!
//! This crate starts the VPN client (`openconnect` by default) on behalf of
//! concurrent callers, classifies its line-oriented output, and turns it into
//! synchronous connect / disconnect / status answers. It has no HTTP
//! dependencies.
//!
//! # Example
//!
//! ```no_run
//! use vpn_supervisor::{ClientCommand, ConnectOutcome, Credentials, Supervisor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let supervisor = Supervisor::new(ClientCommand::default());
//!
//!     let credentials = Credentials {
//!         user: "alice".to_string(),
//!         saml_cookie: Some("prelogin-cookie".to_string()),
//!         gateway: "gw-group".to_string(),
//!         gateway_domain: "vpn.example.com".to_string(),
//!         ..Default::default()
//!     };
//!
//!     match supervisor.connect(&credentials).await.unwrap() {
//!         ConnectOutcome::SamlChallenge { url } => println!("log in at {}", url),
//!         other => println!("{:?}", other),
//!     }
//!
//!     println!("{}", supervisor.disconnect().await);
//! }
//! ```

pub mod classifier;
mod credentials;
mod error;
mod process;
mod state;
mod supervisor;

pub use credentials::{AuthSecret, Credentials};
pub use error::{ParseWarning, SupervisorError};
pub use process::ClientCommand;
pub use state::{ConnectionStatus, Generation};
pub use supervisor::{ConnectOutcome, Supervisor};
