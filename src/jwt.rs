use std::future::{ready, Ready};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ErrorUnauthorized,
    http::header,
    web, Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;

/// Verifies the bearer token and stores its claims in the request
/// extensions, where handlers pick them up as `web::ReqData<T>`.
pub struct JwtAuth<T: DeserializeOwned> {
    key: Arc<DecodingKey>,
    phantom: PhantomData<T>,
}

impl<T: DeserializeOwned> Clone for JwtAuth<T> {
    fn clone(&self) -> Self {
        JwtAuth {
            key: self.key.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JwtAuth<T> {
    pub fn new(secret: &str) -> Self {
        JwtAuth {
            key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            phantom: PhantomData,
        }
    }
}

impl<S, B, T> Transform<S, ServiceRequest> for JwtAuth<T>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    T: DeserializeOwned + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtAuthMiddleware<S, T>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddleware {
            service: Rc::new(service),
            key: self.key.clone(),
            phantom: PhantomData,
        }))
    }
}

pub struct JwtAuthMiddleware<S, T> {
    key: Arc<DecodingKey>,
    service: Rc<S>,
    phantom: PhantomData<T>,
}

impl<S, B, T> Service<ServiceRequest> for JwtAuthMiddleware<S, T>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    T: DeserializeOwned + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = match extract_token(&req) {
            Some(token) => token,
            None => {
                debug!(path = req.path(), "request without bearer token");
                return Box::pin(ready(Err(ErrorUnauthorized("No token found"))));
            }
        };

        let token_data = match decode::<T>(&token, &self.key, &Validation::default()) {
            Ok(token_data) => token_data,
            Err(err) => {
                debug!(path = req.path(), %err, "rejected bearer token");
                return Box::pin(ready(Err(ErrorUnauthorized("Invalid token"))));
            }
        };

        req.extensions_mut().insert(token_data.claims);

        let service = self.service.clone();

        Box::pin(async move { service.call(req).await })
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

/// `Authorization: Bearer <jwt>`, or `?token=<jwt>` for websocket clients
/// that cannot set headers on the upgrade request.
fn extract_token(req: &ServiceRequest) -> Option<String> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string());

    header.or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .map(|query| query.into_inner().token)
    })
}
