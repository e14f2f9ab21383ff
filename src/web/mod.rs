mod handlers;
mod routes;
mod video_ws;
mod ws;

pub use routes::create_router;
pub use video_ws::video_ws_handler;
pub use ws::ws_handler;
