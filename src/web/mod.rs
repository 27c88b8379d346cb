mod handlers;
mod relay_ws;
mod routes;

pub use relay_ws::relay_ws_handler;
pub use routes::create_router;
