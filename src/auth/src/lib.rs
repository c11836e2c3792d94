// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bearer credentials for Google Cloud and other OAuth 2.0 services.
//!
//! **WARNING:** this crate is under active development. We expect multiple
//! breaking changes in the upcoming releases.
//!
//! This crate contains types and functions to obtain, cache, and refresh
//! access tokens, and to sign and verify JWTs. Applications create a
//! [credentials::Credentials] and ask it for the headers to attach to each
//! request. The credentials fetch a token on first use, share it across
//! callers, and refresh it shortly before it expires. Concurrent callers
//! waiting on an expired token share a single token exchange.
//!
//! The main entry points are:
//!
//! * [credentials::resolve], which finds the credentials for the current
//!   environment.
//! * [credentials::Builder], which creates credentials from a JSON
//!   credentials file.
//! * [jwt], to encode and verify JWTs with the keys in [signer].
//!
//! [Authentication methods at Google] is a good introduction on the topic of
//! authentication for Google Cloud services. The guide also describes the
//! common terminology used with authentication, such as [Principals],
//! [Tokens], and [Credentials].
//!
//! [Authentication methods at Google]: https://cloud.google.com/docs/authentication
//! [Principals]: https://cloud.google.com/docs/authentication#principal
//! [Tokens]: https://cloud.google.com/docs/authentication#token
//! [Credentials]: https://cloud.google.com/docs/authentication#credentials

pub mod build_errors;
pub mod clock;
pub mod credentials;
pub mod errors;
pub mod http;
pub mod jwt;
pub mod signer;
pub mod token;

/// Headers utility functions to work with Google Cloud authentication [Credentials].
///
/// [Credentials]: https://cloud.google.com/docs/authentication#credentials
pub(crate) mod headers_util;

/// The token cache
pub(crate) mod token_cache;

/// A `Result` alias where the `Err` case is
/// `cloud_credentials::errors::CredentialsError`.
pub(crate) type Result<T> = std::result::Result<T, crate::errors::CredentialsError>;
