//! Scene model: the drawable objects on one canvas and their change events.
//!
//! This stands in for the rendering library. It owns object order (paint
//! order, back to front), canvas size and background, and queues a
//! [`SceneEvent`] for every mutation so the session can decide whether the
//! change is a user edit or a side effect of a restore.

use serde::{Deserialize, Serialize};

use crate::ids::ObjectId;

/// Default canvas edge length in pixels
pub const DEFAULT_CANVAS_SIZE: f64 = 1080.0;

/// Default canvas background
pub const DEFAULT_BACKGROUND: &str = "white";

/// Position, extent and rotation shared by every shape kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default = "one")]
    pub scale_x: f64,
    #[serde(default = "one")]
    pub scale_y: f64,
    #[serde(default)]
    pub angle: f64,
}

impl Transform {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
            scale_x: 1.0,
            scale_y: 1.0,
            angle: 0.0,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

fn one() -> f64 {
    1.0
}

/// Fill and stroke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default)]
    pub stroke_width: f64,
    #[serde(default = "one")]
    pub opacity: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fill: Some("#000000".to_string()),
            stroke: None,
            stroke_width: 1.0,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextProps {
    pub text: String,
    pub font_family: String,
    pub font_size: f64,
    #[serde(default = "normal")]
    pub font_weight: String,
    #[serde(default = "normal")]
    pub font_style: String,
    #[serde(default = "left")]
    pub text_align: String,
}

impl TextProps {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_family: "Arial".to_string(),
            font_size: 20.0,
            font_weight: normal(),
            font_style: normal(),
            text_align: left(),
        }
    }
}

fn normal() -> String {
    "normal".to_string()
}

fn left() -> String {
    "left".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RectProps {
    #[serde(default)]
    pub rx: f64,
    #[serde(default)]
    pub ry: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleProps {
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EllipseProps {
    pub rx: f64,
    pub ry: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonProps {
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProps {
    pub src: String,
}

/// The fixed set of shape kinds, each with its own properties.
///
/// Serialized with a `type` tag next to the common fields, matching the
/// persisted `designData.objects[]` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    #[serde(rename = "textbox")]
    Text(TextProps),
    Rect(RectProps),
    Circle(CircleProps),
    Ellipse(EllipseProps),
    Triangle,
    Polygon(PolygonProps),
    Image(ImageProps),
}

impl Shape {
    /// Short kind label, as used in the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Shape::Text(_) => "textbox",
            Shape::Rect(_) => "rect",
            Shape::Circle(_) => "circle",
            Shape::Ellipse(_) => "ellipse",
            Shape::Triangle => "triangle",
            Shape::Polygon(_) => "polygon",
            Shape::Image(_) => "image",
        }
    }
}

/// One drawable entity on the canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    /// Identity; private so that it cannot change after creation
    id: ObjectId,
    /// User-facing label, independent of identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub transform: Transform,
    #[serde(flatten)]
    pub style: Style,
    #[serde(flatten)]
    pub shape: Shape,
}

impl SceneObject {
    pub fn new(id: ObjectId, shape: Shape, transform: Transform) -> Self {
        Self {
            id,
            name: None,
            transform,
            style: Style::default(),
            shape,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Zero-width or zero-height objects are helper guides
    pub fn has_extent(&self) -> bool {
        self.transform.width != 0.0 && self.transform.height != 0.0
    }
}

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Change notification queued by every scene mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneEvent {
    pub kind: ChangeKind,
    /// `None` for canvas-level changes (background, size)
    pub target: Option<ObjectId>,
    /// Whether the target has a non-zero extent; canvas changes count as true
    pub has_extent: bool,
}

impl SceneEvent {
    fn object(kind: ChangeKind, obj: &SceneObject) -> Self {
        Self {
            kind,
            target: Some(obj.id.clone()),
            has_extent: obj.has_extent(),
        }
    }

    fn canvas() -> Self {
        Self {
            kind: ChangeKind::Modified,
            target: None,
            has_extent: true,
        }
    }
}

/// The editable scene: ordered objects plus canvas size and background
#[derive(Debug, Clone)]
pub struct Scene {
    objects: Vec<SceneObject>,
    background: Option<String>,
    width: f64,
    height: f64,
    events: Vec<SceneEvent>,
}

impl Scene {
    /// Empty scene with a white background
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            objects: Vec::new(),
            background: Some(DEFAULT_BACKGROUND.to_string()),
            width,
            height,
            events: Vec::new(),
        }
    }

    /// Objects in paint order, bottom first
    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    /// Number of objects, guides included
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Canvas background colour, `None` for transparent
    pub fn background(&self) -> Option<&str> {
        self.background.as_deref()
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    /// Look up an object by id
    pub fn get(&self, id: &ObjectId) -> Option<&SceneObject> {
        self.objects.iter().find(|o| &o.id == id)
    }

    /// Paint-order index of an object
    pub fn index_of(&self, id: &ObjectId) -> Option<usize> {
        self.objects.iter().position(|o| &o.id == id)
    }

    /// Add an object on top. Returns false if an object with that id exists.
    pub fn add(&mut self, obj: SceneObject) -> bool {
        if self.index_of(&obj.id).is_some() {
            return false;
        }
        self.events.push(SceneEvent::object(ChangeKind::Added, &obj));
        self.objects.push(obj);
        true
    }

    /// Remove an object by id
    pub fn remove(&mut self, id: &ObjectId) -> Option<SceneObject> {
        let index = self.index_of(id)?;
        let obj = self.objects.remove(index);
        self.events.push(SceneEvent::object(ChangeKind::Removed, &obj));
        Some(obj)
    }

    /// Modify an object in place. Identity is out of reach of `f`.
    pub fn modify<F>(&mut self, id: &ObjectId, f: F) -> bool
    where
        F: FnOnce(&mut SceneObject),
    {
        let Some(obj) = self.objects.iter_mut().find(|o| &o.id == id) else {
            return false;
        };
        let original_id = obj.id.clone();
        f(obj);
        obj.id = original_id;
        let event = SceneEvent::object(ChangeKind::Modified, obj);
        self.events.push(event);
        true
    }

    /// Move an object to a new paint-order index, shifting the others
    pub fn move_to(&mut self, id: &ObjectId, index: usize) -> bool {
        let Some(from) = self.index_of(id) else {
            return false;
        };
        let to = index.min(self.objects.len() - 1);
        if from == to {
            return true;
        }
        let obj = self.objects.remove(from);
        self.events.push(SceneEvent::object(ChangeKind::Modified, &obj));
        self.objects.insert(to, obj);
        true
    }

    /// Change the background. Queues an event only when it differs.
    pub fn set_background(&mut self, background: Option<String>) {
        if self.background != background {
            self.background = background;
            self.events.push(SceneEvent::canvas());
        }
    }

    /// Change the canvas size. Queues an event only when it differs.
    pub fn resize(&mut self, width: f64, height: f64) {
        if self.width != width || self.height != height {
            self.width = width;
            self.height = height;
            self.events.push(SceneEvent::canvas());
        }
    }

    /// Replace the entire contents, firing removed/added for every object
    pub fn replace_all(
        &mut self,
        objects: Vec<SceneObject>,
        background: Option<String>,
        width: f64,
        height: f64,
    ) {
        for old in self.objects.drain(..) {
            self.events.push(SceneEvent::object(ChangeKind::Removed, &old));
        }
        for obj in &objects {
            self.events.push(SceneEvent::object(ChangeKind::Added, obj));
        }
        self.objects = objects;
        self.background = background;
        self.width = width;
        self.height = height;
    }

    /// Drain queued change notifications
    pub fn take_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether notifications are waiting for [`take_events`](Self::take_events)
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(DEFAULT_CANVAS_SIZE, DEFAULT_CANVAS_SIZE)
    }
}
