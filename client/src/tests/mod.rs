/*
 * Created on Tue Jul 16 2024
 *
 * This file is a part of the iproto driver
 * The iproto driver is a free and open-source asynchronous client, written
 * by Sayan Nandan ("the Author"), for databases speaking the MessagePack
 * based iproto protocol, with the vision to provide a safe, reliable and
 * performant driver for the Rust ecosystem.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! End-to-end tests of the engine against an in-process mock server

mod write_paths;
