use std::future::{Future, IntoFuture};

use futures::{
	future::try_join_all,
	stream::{FuturesUnordered, StreamExt},
};
use tracing::trace;

/// Waits for every future to succeed, short circuiting on the first failure.
///
/// Outputs are kept in the same order as the inputs.
pub async fn all_of<I, T, E>(futures: I) -> Result<Vec<T>, E>
where
	I: IntoIterator,
	I::Item: IntoFuture<Output = Result<T, E>>,
{
	try_join_all(futures.into_iter().map(IntoFuture::into_future)).await
}

/// Resolves with the first future to succeed, the remaining ones are dropped.
///
/// If every future fails, all errors are returned in completion order. An empty input fails
/// with an empty error list.
pub async fn any_of<I, T, E>(futures: I) -> Result<T, Vec<E>>
where
	I: IntoIterator,
	I::Item: IntoFuture<Output = Result<T, E>>,
{
	let mut pending = futures
		.into_iter()
		.map(IntoFuture::into_future)
		.collect::<FuturesUnordered<_>>();

	let mut errors = Vec::with_capacity(pending.len());

	while let Some(res) = pending.next().await {
		match res {
			Ok(out) => {
				trace!(
					remaining = pending.len(),
					"any_of resolved, dropping remaining futures"
				);
				return Ok(out);
			}
			Err(e) => errors.push(e),
		}
	}

	Err(errors)
}

/// Runs `check` over the successful output of `task` before handing it out. The output is only
/// released after `check` finishes, whatever it decides to do with it.
pub async fn post_process<Fut, T, E, C, CFut>(task: Fut, check: C) -> Result<T, E>
where
	Fut: IntoFuture<Output = Result<T, E>>,
	C: FnOnce(&T) -> CFut,
	CFut: Future<Output = Result<(), E>>,
{
	let out = task.await?;

	check(&out).await?;

	Ok(out)
}
