use axum::Router;
use std::sync::Arc;

use crate::AppState;

mod displays;
mod playlists;
mod public;
mod timeline;
mod ws;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/displays", displays::routes())
        .nest("/playlists", playlists::routes())
        .nest("/timeline", timeline::routes())
        .nest("/api", public::routes())
        .route("/ws", axum::routing::get(ws::websocket_handler))
}
