use actix_web::{http::header, web, HttpRequest, HttpResponse};
use log::info;
use serde_json::json;

use crate::auth::{check_admin_token, verify_init_data};
use crate::error::ApiError;
use crate::models::{
    AdminDeleteRequest, AuthRequest, AuthResponse, AuthUser, BuyProductRequest,
    BuySubscriptionRequest, ExtendSubscriptionRequest, PaymentIdRequest, ReferralBonusRequest,
    SubmitOrderRequest, TgQuery, TrialRequest,
};
use crate::service::SubscriptionService;

type Service = web::Data<SubscriptionService>;
type Reply = Result<HttpResponse, ApiError>;

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "OK" }))
}

// Telegram Mini App initData check
async fn auth(service: Service, data: web::Json<AuthRequest>) -> Reply {
    let user = verify_init_data(&data.init_data, &service.settings().bot_token)?;
    info!("Mini App auth: tg_id={}, username={:?}", user.id, user.username);
    Ok(HttpResponse::Ok().json(AuthResponse {
        user: AuthUser {
            telegram_id: user.id,
            first_name: user.first_name,
        },
    }))
}

async fn subscriptions(service: Service, query: web::Query<TgQuery>) -> Reply {
    Ok(HttpResponse::Ok().json(service.list_subscriptions(query.tg_id).await))
}

async fn referrals(service: Service, query: web::Query<TgQuery>) -> Reply {
    Ok(HttpResponse::Ok().json(service.list_referrals(query.tg_id).await?))
}

async fn buy_subscription(service: Service, data: web::Json<BuySubscriptionRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.buy_subscription(data.into_inner()).await?))
}

async fn extend_subscription(
    service: Service,
    data: web::Json<ExtendSubscriptionRequest>,
) -> Reply {
    Ok(HttpResponse::Ok().json(service.request_extension(data.into_inner()).await?))
}

async fn check_payment_status(service: Service, data: web::Json<PaymentIdRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.confirm_subscription_payment(&data.payment_id).await?))
}

async fn buy_product(service: Service, data: web::Json<BuyProductRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.buy_product(data.into_inner()).await?))
}

async fn check_product_payment(service: Service, data: web::Json<PaymentIdRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.confirm_product_payment(&data.payment_id).await?))
}

async fn cancel_payment(service: Service, data: web::Json<PaymentIdRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.cancel_payment(&data.payment_id).await?))
}

async fn activate_trial(service: Service, data: web::Json<TrialRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.activate_trial(data.tg_id).await?))
}

async fn submit_order(service: Service, data: web::Json<SubmitOrderRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.submit_order(data.into_inner()).await?))
}

async fn apply_referral_bonus(service: Service, data: web::Json<ReferralBonusRequest>) -> Reply {
    Ok(HttpResponse::Ok().json(service.apply_referral_bonus(data.into_inner()).await?))
}

fn require_admin(req: &HttpRequest, service: &SubscriptionService) -> Result<(), ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    check_admin_token(header, service.settings().admin_api_token.as_deref())
}

async fn reauthenticate(req: HttpRequest, service: Service) -> Reply {
    require_admin(&req, &service)?;
    Ok(HttpResponse::Ok().json(service.reauthenticate_panels().await))
}

async fn delete_subscription(
    req: HttpRequest,
    service: Service,
    data: web::Json<AdminDeleteRequest>,
) -> Reply {
    require_admin(&req, &service)?;
    Ok(HttpResponse::Ok().json(service.delete_subscription(&data.panel, &data.email).await?))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(health)))
        .service(web::resource("/api/auth").route(web::post().to(auth)))
        .service(web::resource("/api/subscriptions").route(web::get().to(subscriptions)))
        .service(web::resource("/api/referrals").route(web::get().to(referrals)))
        .service(web::resource("/api/buy-subscription").route(web::post().to(buy_subscription)))
        .service(
            web::resource("/api/extend-subscription").route(web::post().to(extend_subscription)),
        )
        .service(
            web::resource("/api/check-payment-status").route(web::post().to(check_payment_status)),
        )
        .service(web::resource("/api/buy-product").route(web::post().to(buy_product)))
        .service(
            web::resource("/api/check-product-payment")
                .route(web::post().to(check_product_payment)),
        )
        .service(web::resource("/api/cancel-payment").route(web::post().to(cancel_payment)))
        .service(web::resource("/api/activate-trial").route(web::post().to(activate_trial)))
        .service(web::resource("/api/submit-order").route(web::post().to(submit_order)))
        .service(
            web::resource("/api/apply-referral-bonus")
                .route(web::post().to(apply_referral_bonus)),
        )
        .service(
            web::resource("/api/admin/reauthenticate").route(web::post().to(reauthenticate)),
        )
        .service(
            web::resource("/api/admin/delete-subscription")
                .route(web::post().to(delete_subscription)),
        );
}
