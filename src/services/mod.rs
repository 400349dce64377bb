// Services module - business logic layer

pub mod credentials;
pub mod displays;
pub mod feed;
pub mod playback;
pub mod playlists;
pub mod timeline;
