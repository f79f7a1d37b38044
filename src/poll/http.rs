use crate::itm::Item;
use crate::poll::result::{completion, CheckError, CheckFuture};
use std::time::Duration;

/// Dispatches an asynchronous HTTP check on the poller's shared client.
///
/// Building the request validates the item URL; a failure there is a
/// synchronous configuration error.
pub(crate) fn dispatch(
	item: Item,
	client: &reqwest::Client,
	timeout: Duration,
) -> Result<CheckFuture, (Item, CheckError)> {
	let request = match client.get(item.url.as_str()).timeout(timeout).build() {
		Ok(request) => request,
		Err(e) => {
			let msg = format!("cannot create HTTP request for \"{}\": {e}", item.url);
			return Err((item, CheckError::config(msg)));
		}
	};
	let client = client.clone();
	Ok(Box::pin(async move {
		let outcome = perform(&client, request, &item).await;
		completion(item, outcome)
	}))
}

async fn perform(
	client: &reqwest::Client,
	request: reqwest::Request,
	item: &Item,
) -> Result<String, CheckError> {
	let response = client.execute(request).await.map_err(classify)?;
	let status = response.status();
	let body = response.text().await.map_err(classify)?;
	if !status_code_matches(&item.status_codes, status.as_u16()) {
		if status.is_server_error() {
			return Err(CheckError {
				errcode: crate::val::ErrCode::GatewayError,
				msg: format!("server returned status \"{}\"", status.as_u16()),
			});
		}
		return Err(CheckError::unsupported(format!(
			"response code \"{}\" did not match any of the required status codes \"{}\"",
			status.as_u16(),
			item.status_codes
		)));
	}
	Ok(body)
}

fn classify(e: reqwest::Error) -> CheckError {
	if e.is_timeout() {
		return CheckError::timeout(format!("HTTP check timed out: {e}"));
	}
	if e.is_builder() || e.is_request() {
		return CheckError::config(format!("invalid HTTP request: {e}"));
	}
	CheckError::network(format!("HTTP check failed: {e}"))
}

/// Matches a status code against a comma-separated list of codes and
/// `min-max` ranges. An empty list accepts any 2xx code.
fn status_code_matches(list: &str, code: u16) -> bool {
	if list.trim().is_empty() {
		return (200..300).contains(&code);
	}
	for part in list.split(',') {
		let part = part.trim();
		match part.split_once('-') {
			Some((min, max)) => {
				if let (Ok(min), Ok(max)) = (min.trim().parse::<u16>(), max.trim().parse::<u16>())
				{
					if (min..=max).contains(&code) {
						return true;
					}
				}
			}
			None => {
				if part.parse::<u16>() == Ok(code) {
					return true;
				}
			}
		}
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_code_lists_and_ranges() {
		assert!(status_code_matches("", 200));
		assert!(status_code_matches("", 204));
		assert!(!status_code_matches("", 301));
		assert!(status_code_matches("200", 200));
		assert!(!status_code_matches("200", 201));
		assert!(status_code_matches("200-299,301", 301));
		assert!(status_code_matches("200-299,301", 250));
		assert!(!status_code_matches("200-299,301", 302));
	}
}
