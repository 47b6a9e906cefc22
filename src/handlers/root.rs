use actix_web::HttpResponse;

/// `GET /` - static liveness greeting, never touches the broker.
pub async fn greeting() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body("Hello World!")
}
