pub mod static_routes;
pub mod tenant_routes;
