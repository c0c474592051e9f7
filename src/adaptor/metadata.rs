use tonic::metadata::AsciiMetadataValue;
use tonic::{Request, Status};

use crate::peer::PeerId;

/// Request metadata key carrying the calling peer's id.
pub const PEER_ID_HEADER: &str = "x-peer-id";

pub(crate) fn header_value(peer_id: PeerId) -> Result<AsciiMetadataValue, crate::Error> {
    Ok(AsciiMetadataValue::try_from(peer_id.to_string())?)
}

pub(crate) fn attach<T>(message: T, header: &AsciiMetadataValue) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(PEER_ID_HEADER, header.clone());
    request
}

/// Read the calling peer's id from the request metadata.
pub(crate) fn peer_id<T>(request: &Request<T>) -> Result<PeerId, Status> {
    let value = request
        .metadata()
        .get(PEER_ID_HEADER)
        .ok_or_else(|| Status::invalid_argument(format!("missing {PEER_ID_HEADER} header")))?;

    value
        .to_str()
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| Status::invalid_argument(format!("malformed {PEER_ID_HEADER} header")))
}
