pub mod a_ae;
pub mod a_aq;
pub mod b_ba;
pub mod b_bmr;
pub mod b_bq;
pub mod n_dr;
pub mod n_mr;

pub use a_ae::AddressErrorHandler;
pub use a_aq::AddressQueryHandler;
pub use b_ba::BackboneAnswerHandler;
pub use b_bmr::ProactiveNotificationHandler;
pub use b_bq::BackboneQueryHandler;
pub use n_dr::DuaRegistrationHandler;
pub use n_mr::MlrRegistrationHandler;
