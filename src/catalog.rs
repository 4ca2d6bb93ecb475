use crate::domain::FormListing;
use crate::error::SyncError;
use crate::http::OpenRosaTransport;
use crate::openrosa;

/// Query the server's form-listing endpoint and produce the remote catalog.
///
/// Every failure mode is folded into a `FormListing` case: an HTTP 401 maps
/// to `AuthRequired` carrying the challenging url, and any transport or
/// XML-shape failure maps to `Failed`. Nothing is thrown past this boundary.
pub fn fetch_form_listing<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    listing_url: &str,
) -> FormListing {
    let body = match transport.fetch_listing(listing_url) {
        Ok(body) => body,
        Err(SyncError::ListingStatus { status: 401, .. }) => {
            return FormListing::AuthRequired {
                url: listing_url.to_string(),
            };
        }
        Err(err) => {
            return FormListing::Failed {
                message: err.to_string(),
            };
        }
    };

    match openrosa::parse_form_listing(&body) {
        Ok(forms) => FormListing::Forms(forms),
        Err(err) => FormListing::Failed {
            message: err.to_string(),
        },
    }
}
