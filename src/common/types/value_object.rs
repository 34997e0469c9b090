/*
 * This file is part of the Obvia ERP.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use serde::Serialize;
use std::fmt::Display;

/// Something that can validate itself and expose its inner value, the seam
/// every scalar value-object (`ValueObject<T>`) is built on top of.
pub trait ValueObjectable {
    type DataType;

    fn validate(&self) -> Result<(), String>;
    fn get_value(&self) -> &Self::DataType;
}

/// A value that has already passed [`ValueObjectable::validate`]. The only
/// way to build one is [`ValueObject::new`], so a `ValueObject<T>` in scope
/// is a proof the wrapped value is well-formed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueObject<T: ValueObjectable>(T);

impl<T: ValueObjectable> ValueObject<T> {
    pub fn new(value: T) -> Result<Self, String> {
        value.validate()?;
        Ok(Self(value))
    }

    pub fn extract(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: ValueObjectable + Display> Display for ValueObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
