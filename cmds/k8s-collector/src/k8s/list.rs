use std::fmt::Debug;

use kube::{api::ListParams, Api};
use serde::de::DeserializeOwned;

/// List every object matching `params`, following continuation tokens.
pub async fn list_all<K>(api: &Api<K>, mut params: ListParams) -> Result<Vec<K>, kube::Error>
where
	K: Clone + DeserializeOwned + Debug,
{
	let mut items = Vec::new();
	loop {
		let page = api.list(&params).await?;
		items.extend(page.items);
		match page.metadata.continue_.filter(|token| !token.is_empty()) {
			Some(token) => params = params.continue_token(&token),
			None => return Ok(items),
		}
	}
}
