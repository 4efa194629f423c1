use std::net::ToSocketAddrs;

use log::trace;

use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::net::{Endpoint, EndpointType};

/// Resolves `host_name` on a worker thread and delivers the endpoints on
/// the loop thread.
///
/// `protocol` filters the result by address family;
/// [`EndpointType::Undefined`] keeps both. Resolution failure delivers an
/// empty list together with `UnknownNodeOrService`.
pub fn resolve_host<F>(lp: &mut EventLoop, host_name: &str, protocol: EndpointType, callback: F)
where
    F: FnOnce(&mut EventLoop, Vec<Endpoint>, &Error) + 'static,
{
    let host = host_name.to_string();
    lp.add_work_with_result(
        move || match (host.as_str(), 0u16).to_socket_addrs() {
            Ok(addrs) => Ok(addrs.collect::<Vec<_>>()),
            Err(_) => Err(Error::with_context(StatusCode::UnknownNodeOrService, host)),
        },
        move |lp, result| match result {
            Ok(addrs) => {
                let endpoints: Vec<Endpoint> = addrs
                    .into_iter()
                    .map(Endpoint::from)
                    .filter(|e| match protocol {
                        EndpointType::Undefined => true,
                        other => e.endpoint_type() == other,
                    })
                    .collect();
                trace!("resolved {} endpoints", endpoints.len());
                callback(lp, endpoints, &Error::ok());
            }
            Err(error) => callback(lp, Vec::new(), &error),
        },
    );
}
