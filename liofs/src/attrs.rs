//! Attribute reads and writes by path.
//!
//! Each call opens the object, performs the attribute call and closes the
//! object again. The close is attempted even when the attribute call failed;
//! the first error observed is the one returned. Writes are retried as a
//! whole according to the context's retry policy.

use std::sync::Arc;

use libopque::Operation;
use log::{debug, warn};
use regex::Regex;
use tokio::sync::oneshot;

use crate::context::LioContext;
use crate::error::{Result, op_status};
use crate::os::{AttrIter, AttrValue, ObjectFd, OpenMode};

/// Owned `(key, value)` pairs for attribute writes; `None` removes the key.
pub type AttrPairs = Vec<(String, Option<String>)>;

fn settle<T>(path: &str, acted: Result<T>, closed: Result<()>) -> Result<T> {
    if let Err(e) = &closed {
        warn!("failed to close {path}: {e}");
    }
    let value = acted?;
    closed?;
    Ok(value)
}

async fn open(lc: &LioContext, path: &str, id: Option<&str>) -> Result<ObjectFd> {
    lc.os()
        .open_object(path, OpenMode::ReadImmediate, id)
        .await
        .inspect_err(|e| warn!("failed to open {path}: {e}"))
}

pub async fn get_multiple_attrs(
    lc: &LioContext,
    path: &str,
    id: Option<&str>,
    keys: &[&str],
) -> Result<Vec<AttrValue>> {
    let fd = open(lc, path, id).await?;
    let got = lc
        .os()
        .get_attrs(&fd, keys, lc.config().max_attr_size)
        .await;
    let closed = lc.os().close_object(fd).await;
    settle(path, got, closed)
}

pub async fn get_attr(
    lc: &LioContext,
    path: &str,
    id: Option<&str>,
    key: &str,
) -> Result<AttrValue> {
    let mut values = get_multiple_attrs(lc, path, id, &[key]).await?;
    Ok(values.pop().flatten())
}

async fn set_multiple_attrs_once(
    lc: &LioContext,
    path: &str,
    id: Option<&str>,
    attrs: &[(&str, Option<&str>)],
) -> Result<()> {
    let fd = open(lc, path, id).await?;
    let set = lc.os().set_attrs(&fd, attrs).await;
    let closed = lc.os().close_object(fd).await;
    settle(path, set, closed)
}

pub async fn set_multiple_attrs(
    lc: &LioContext,
    path: &str,
    id: Option<&str>,
    attrs: &[(&str, Option<&str>)],
) -> Result<()> {
    lc.config()
        .set_attr_retry()
        .run(&format!("setting attributes on {path}"), move || {
            set_multiple_attrs_once(lc, path, id, attrs)
        })
        .await
}

pub async fn set_attr(
    lc: &LioContext,
    path: &str,
    id: Option<&str>,
    key: &str,
    value: Option<&str>,
) -> Result<()> {
    set_multiple_attrs(lc, path, id, &[(key, value)]).await
}

/// Iterates the attributes of `path` whose key matches `key_pattern`.
/// Values are cut to the configured `max_attr_size`; dropping the iterator
/// releases it.
pub async fn create_attr_iter(
    lc: &LioContext,
    path: &str,
    key_pattern: &Regex,
) -> Result<Box<dyn AttrIter>> {
    lc.os()
        .create_attr_iter(path, key_pattern, lc.config().max_attr_size)
        .await
}

/// Every `(key, value)` pair of `path` whose key matches `key_pattern`.
pub async fn get_matching_attrs(
    lc: &LioContext,
    path: &str,
    key_pattern: &Regex,
) -> Result<Vec<(String, String)>> {
    let mut it = create_attr_iter(lc, path, key_pattern).await?;
    let mut pairs = Vec::new();
    while let Some(pair) = it.next_attr().await? {
        pairs.push(pair);
    }
    debug!("{} attributes of {path} match {key_pattern}", pairs.len());
    Ok(pairs)
}

/// Operation form of [`get_multiple_attrs`]. The values arrive on the
/// returned channel once the operation has run.
pub fn gop_get_multiple_attrs(
    lc: &Arc<LioContext>,
    path: &str,
    id: Option<&str>,
    keys: &[&str],
) -> (Operation, oneshot::Receiver<Result<Vec<AttrValue>>>) {
    let (tx, rx) = oneshot::channel();
    let ctx = lc.clone();
    let path = path.to_string();
    let id = id.map(str::to_string);
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let op = Operation::new(lc.tpc_unlimited(), async move {
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let res = get_multiple_attrs(&ctx, &path, id.as_deref(), &keys).await;
        let status = op_status("get attributes", &res);
        // requester may have stopped listening
        let _ = tx.send(res);
        status
    });
    (op, rx)
}

pub fn gop_get_attr(
    lc: &Arc<LioContext>,
    path: &str,
    id: Option<&str>,
    key: &str,
) -> (Operation, oneshot::Receiver<Result<AttrValue>>) {
    let (tx, rx) = oneshot::channel();
    let ctx = lc.clone();
    let path = path.to_string();
    let id = id.map(str::to_string);
    let key = key.to_string();
    let op = Operation::new(lc.tpc_unlimited(), async move {
        let res = get_attr(&ctx, &path, id.as_deref(), &key).await;
        let status = op_status("get attribute", &res);
        let _ = tx.send(res);
        status
    });
    (op, rx)
}

pub fn gop_set_multiple_attrs(
    lc: &Arc<LioContext>,
    path: &str,
    id: Option<&str>,
    attrs: AttrPairs,
) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    let id = id.map(str::to_string);
    Operation::new(lc.tpc_unlimited(), async move {
        let pairs = borrow_pairs(&attrs);
        let res = set_multiple_attrs(&ctx, &path, id.as_deref(), &pairs).await;
        op_status("set attributes", &res)
    })
}

pub fn gop_set_attr(
    lc: &Arc<LioContext>,
    path: &str,
    id: Option<&str>,
    key: &str,
    value: Option<&str>,
) -> Operation {
    gop_set_multiple_attrs(
        lc,
        path,
        id,
        vec![(key.to_string(), value.map(str::to_string))],
    )
}

pub(crate) fn borrow_pairs(attrs: &[(String, Option<String>)]) -> Vec<(&str, Option<&str>)> {
    attrs
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_deref()))
        .collect()
}
