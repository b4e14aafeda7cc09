pub mod hdnea_utils;
pub mod manifest_utils;
pub mod retry_utils;
pub mod secure_url_utils;
