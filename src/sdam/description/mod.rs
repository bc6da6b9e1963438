pub(crate) mod server;
pub(crate) mod server_selection;
pub(crate) mod topology;
