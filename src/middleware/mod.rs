mod wsfed;

pub use wsfed::wsfed_middleware;
