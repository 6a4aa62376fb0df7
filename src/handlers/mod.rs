pub mod cgi;
pub mod router;
