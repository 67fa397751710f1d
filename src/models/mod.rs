pub mod user_2fa;
pub mod user_2fa_pending_setup;

pub use user_2fa::User2faEnrollment;
pub use user_2fa_pending_setup::User2faPendingSetup;
