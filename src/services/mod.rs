pub mod backup_code;
pub mod base32;
pub mod hotp;
pub mod totp;
pub mod two_factor;

pub use backup_code::BackupCodeManager;
pub use base32::Base32Codec;
pub use totp::{TotpClock, TotpService};
pub use two_factor::{SetupProvisioning, TwoFactorService, TwoFactorState, TwoFactorStatus};
