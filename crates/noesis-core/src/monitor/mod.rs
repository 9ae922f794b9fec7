//! Monitor Suite (component #4): three independent instruments over a
//! request's effect on the user — Agency Retention Index, Epistemic Debt
//! Monitor, and Reliance/Dependency Index. Grounded on `original_source`'s
//! `agency_monitor.py` (ARI), `epistemic_monitor.py` (EDM), and
//! `dependency_monitor.py` (RDI).

pub mod ari;
pub mod edm;
pub mod rdi;

pub use ari::AriMonitor;
pub use edm::EdmMonitor;
pub use rdi::RdiMonitor;
