pub mod chat;

pub use chat::*;

use actix_web::web;

use crate::services::query_executor::ReadOnlyDatabase;
use crate::services::{ChatStoreTrait, SettingsProviderTrait};

/// Register the chat routes for one concrete gateway type
pub fn routes<S, C, D>(cfg: &mut web::ServiceConfig)
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    cfg.service(web::resource("/threads").route(web::post().to(create_thread::<S, C, D>)))
        .service(web::resource("/threads/{thread_id}").route(web::delete().to(delete_thread::<S, C, D>)))
        .service(
            web::resource("/threads/{thread_id}/turns")
                .route(web::get().to(get_turns::<S, C, D>))
                .route(web::delete().to(clear_turns::<S, C, D>)),
        )
        .service(web::resource("/threads/{thread_id}/ask").route(web::post().to(ask::<S, C, D>)))
        .service(web::resource("/threads/{thread_id}/ask/stream").route(web::post().to(ask_stream::<S, C, D>)));
}
