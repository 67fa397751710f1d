pub mod health;
pub mod two_factor;

pub use health::health_check;
pub use two_factor::{
    cancel_2fa, disable_2fa, login_verify_2fa, regenerate_backup_codes, setup_2fa, status_2fa,
    verify_2fa,
};
