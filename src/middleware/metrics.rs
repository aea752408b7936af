use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Label for requests that matched no route, so stray paths share one entry.
const UNMATCHED: &str = "<unmatched>";

/// Records a count, duration and error flag per route into [`AppState`].
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            if let Ok(response) = &result {
                let status = response.status();
                let is_error = status.is_client_error() || status.is_server_error();

                // The route pattern is only known once routing has run
                let request = response.request();
                let route = request.match_pattern().unwrap_or_else(|| UNMATCHED.to_string());
                let endpoint = format!("{} {}", method, route);

                if let Some(app_state) = request.app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}
