pub mod api_error;
pub mod constants;
pub mod path_utils;
pub mod schemas;
pub mod telemetry;
pub mod time_utils;
pub mod url_utils;
