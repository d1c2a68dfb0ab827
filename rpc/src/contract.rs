//! Compile-time RPC contracts.
//!
//! Each remote operation is a zero-sized marker type implementing
//! [`RpcMethod`] or [`RpcNotification`]. Both ends name the same marker, so
//! the method name and the shapes of params and result are checked by the
//! compiler rather than discovered at runtime.
//!
//! ```
//! use hookpipe_rpc::{RpcMethod, RpcNotification};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct AddParams {
//!     left_hand:  i64,
//!     right_hand: i64,
//! }
//!
//! struct Add;
//!
//! impl RpcMethod for Add {
//!     const NAME: &'static str = "Add";
//!     type Params = AddParams;
//!     type Output = i64;
//! }
//!
//! struct OnCreateFile;
//!
//! impl RpcNotification for OnCreateFile {
//!     const NAME: &'static str = "OnCreateFile";
//!     type Params = Vec<String>;
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};

use crate::naming::to_camel_case;

/// A request/response operation
pub trait RpcMethod {
    /// Method name; normalized to camelCase on the wire
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned;
    type Output: Serialize + DeserializeOwned;

    fn wire_name() -> String {
        to_camel_case(Self::NAME)
    }
}

/// A one-way operation; the receiver never replies
pub trait RpcNotification {
    /// Method name; normalized to camelCase on the wire
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned;

    fn wire_name() -> String {
        to_camel_case(Self::NAME)
    }
}
